pub mod directory;
pub mod migrations;
pub mod pool;
pub mod store;
