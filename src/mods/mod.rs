pub mod live;
pub mod offline;
