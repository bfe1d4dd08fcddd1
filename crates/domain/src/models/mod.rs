//! Domain models for access codes.

pub mod access_code;
pub mod integrity;
pub mod scan_attempt;

pub use access_code::{AccessCode, CodeStats, CodeStatus, ScanPolicy};
pub use integrity::{AnchorReceipt, AnchorStatus, AnchorVerification, IntegrityReport};
pub use scan_attempt::{ReasonCode, ScanAttempt, ScanContext, ScanOutcome};
