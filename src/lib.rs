//! Folio: content administration backend.
//!
//! Typed record storage with change notifications, read-through record
//! caches and a blob lifecycle manager for uploaded media.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
