//! Concurrent B+ tree index over the buffer pool.

mod context;
mod tree;

pub use tree::BPlusTree;
