//! Domain layer for the QR access service.
//!
//! This crate contains:
//! - Domain models (AccessCode, ScanAttempt, integrity types)
//! - Business logic services (issuance, scan validation, regeneration, anchoring)
//! - Storage and collaborator ports with in-memory adapters
//! - Domain error types

pub mod errors;
pub mod models;
pub mod services;
