//! Secondary indexes: an order-4 B+Tree per indexed column and the manager that
//! builds, persists and lazily loads them.

pub mod btree;
pub mod manager;

pub use btree::{BPlusTree, IndexKey};
pub use manager::IndexManager;
