//! Fixed-capacity batch accumulator with a stable dedup identifier.

/// A pre-allocated, bounded accumulator of records plus a monotonically
/// non-decreasing batch id used for broker-side deduplication.
///
/// The id only advances on [`clear`](Self::clear); retrying a send that
/// failed with a retryable error reuses the same id and the same contents.
pub struct BatchRecords<T> {
    id: u64,
    records: Vec<T>,
    capacity: usize,
}

impl<T> BatchRecords<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            id: 0,
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() == self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Append a record.
    ///
    /// # Panics
    ///
    /// Panics if the batch is already at capacity. Callers must check
    /// [`is_full`](Self::is_full) before appending; this is a programming
    /// error assertion, not a runtime condition the engine can hit in
    /// practice.
    pub fn append(&mut self, record: T) {
        assert!(
            !self.is_full(),
            "BatchRecords is full, can't append any more records"
        );
        self.records.push(record);
    }

    /// Empty the batch and advance the dedup id for the next batch.
    pub fn clear(&mut self) {
        self.records.clear();
        self.id += 1;
    }

    pub fn records(&self) -> &[T] {
        &self.records
    }
}
