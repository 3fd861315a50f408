//! Bulk import and backup/restore pipeline for the quotes catalogue.
//!
//! The binary in `main.rs` is a thin CLI over these modules; an HTTP layer can
//! embed them the same way.

pub mod backup;
pub mod config;
pub mod errors;
pub mod import;
pub mod restore;
pub mod storage;
pub mod store;
pub mod utils;
