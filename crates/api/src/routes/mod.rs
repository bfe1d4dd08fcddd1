//! HTTP route handlers.

pub mod access_codes;
pub mod health;
pub mod scans;
