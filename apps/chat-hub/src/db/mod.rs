pub mod kv;
pub mod memory;
pub mod store;
