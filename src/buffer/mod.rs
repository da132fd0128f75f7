//! Buffer pool: a fixed set of in-memory page frames with LRU eviction.

mod frame;
mod latch;
mod lru;
mod pool;

pub use frame::Frame;
pub use latch::Latch;
pub use pool::BufferPoolManager;
