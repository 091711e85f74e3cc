pub mod error;
pub mod graph;
pub mod storage;
pub mod utils;
