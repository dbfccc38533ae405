//! Plain numeric allocation aggregation.

/// Running totals for a set of allocations: bytes requested and call count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocCount {
    pub num_bytes: u64,
    pub num_allocs: u64,
}

impl AllocCount {
    #[must_use]
    pub const fn new() -> Self {
        Self { num_bytes: 0, num_allocs: 0 }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Record one allocation of `bytes` bytes.
    pub fn record_alloc(&mut self, bytes: usize) {
        self.num_allocs += 1;
        self.num_bytes += bytes as u64;
    }

    /// Merge another counter into this one, leaving the other untouched.
    pub fn add(&mut self, other: &AllocCount) {
        self.num_bytes += other.num_bytes;
        self.num_allocs += other.num_allocs;
    }

    /// Merge another counter into this one and reset the other.
    pub fn drain(&mut self, other: &mut AllocCount) {
        self.add(&*other);
        other.reset();
    }
}
