//! Shared utilities and common types for the access control backend.
//!
//! This crate provides common functionality used across all other crates:
//! - Cryptographic utilities (hashing, token format checks)
//! - Common request-field validation
//! - Cursor pagination

pub mod crypto;
pub mod pagination;
pub mod validation;
