//! Key-value store boundary driven by the benchmark workload.

pub mod plainhash;

pub use plainhash::PlainHash;

pub type Key = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    NotFound,
    NotImplemented,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationResult {
    pub entries_touched: usize,
    pub status: Status,
}

impl OperationResult {
    pub const fn ok(entries_touched: usize) -> Self {
        Self {
            entries_touched,
            status: Status::Ok,
        }
    }

    pub const fn not_found() -> Self {
        Self {
            entries_touched: 0,
            status: Status::NotFound,
        }
    }

    pub const fn not_implemented() -> Self {
        Self {
            entries_touched: 0,
            status: Status::NotImplemented,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Operations a store exposes to the workload. Value buffers are cleared
/// and refilled by the read family.
pub trait Store {
    fn upsert(&self, key: Key, value: &[u8]) -> OperationResult;

    /// Overwrites `key` only if it already exists.
    fn update(&self, key: Key, value: &[u8]) -> OperationResult;

    fn remove(&self, key: Key) -> OperationResult;

    fn read(&self, key: Key, value: &mut Vec<u8>) -> OperationResult;

    fn batch_upsert(&self, entries: &[(Key, &[u8])]) -> OperationResult;

    /// Concatenates the values of `keys` in order.
    fn batch_read(&self, keys: &[Key], values: &mut Vec<u8>) -> OperationResult;

    fn bulk_load(&self, entries: &[(Key, &[u8])]) -> OperationResult {
        self.batch_upsert(entries)
    }

    /// Concatenates the values found in `key..key + length`.
    fn range_select(&self, key: Key, length: usize, values: &mut Vec<u8>) -> OperationResult;

    /// Visits `key..key + length`, leaving the last value found in `value`.
    fn scan(&self, key: Key, length: usize, value: &mut Vec<u8>) -> OperationResult;

    fn flush(&self) -> anyhow::Result<()>;

    fn size_on_disk(&self) -> u64;

    fn transaction(&self) -> Result<Box<dyn Transaction + '_>, OperationResult> {
        Err(OperationResult::not_implemented())
    }
}

/// A batch of store operations applied atomically on commit.
pub trait Transaction: Store {
    fn commit(self: Box<Self>) -> OperationResult;
}
