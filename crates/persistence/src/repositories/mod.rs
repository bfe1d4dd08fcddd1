//! Repository implementations of the domain storage ports.

pub mod access_code;
pub mod registration;
pub mod scan_attempt;

pub use access_code::AccessCodeRepository;
pub use registration::{AttendanceRepository, RegistrationRepository};
pub use scan_attempt::ScanAttemptRepository;
