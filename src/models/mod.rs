// src/models/mod.rs
//! Data structures shared by the services and the store.

pub mod document;
pub mod identity;
pub mod signature;
pub mod workflow;
