pub mod db_storage;

pub use db_storage::{CycleReport, DbCoinStorage, RowFailure};
