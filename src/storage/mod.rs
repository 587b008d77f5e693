// src/storage/mod.rs
pub mod schema;
pub mod sqlite_store;
