//! Database entity definitions.

pub mod access_code;
pub mod scan_attempt;

pub use access_code::{AccessCodeEntity, ACCESS_CODE_COLUMNS};
pub use scan_attempt::{ScanAttemptEntity, SCAN_ATTEMPT_COLUMNS};
