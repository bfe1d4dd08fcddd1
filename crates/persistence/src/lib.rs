//! Persistence layer for the QR access service.
//!
//! This crate contains:
//! - Database connection management and embedded migrations
//! - Entity definitions (database row mappings)
//! - Repository implementations of the domain storage ports

pub mod db;
pub mod entities;
pub mod metrics;
pub mod repositories;
