pub mod btree;
pub mod compare;
pub mod database;
pub mod file;
pub mod varint;

pub use btree::{DupMode, PageError, PageResult};
pub use compare::{CompareFn, Comparator};
pub use database::{Database, DbError, DbResult, JumpMode, OpenOptions, Tuning};
pub use file::{HashStore, OpenMode, Store, StoreError, StoreResult};
