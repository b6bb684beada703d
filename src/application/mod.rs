//! Application services: storage facade, blob lifecycle and page maintenance.

pub mod blobs;
pub mod error;
pub mod files;
pub mod ids;
pub mod outcome;
pub mod pages;
pub mod repos;
pub mod storage;
