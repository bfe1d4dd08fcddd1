//! Domain services for access codes.
//!
//! Services contain business logic that operates on domain models through
//! the ports in [`ports`].

pub mod access_control;
pub mod clock;
pub mod integrity;
pub mod issuer;
pub mod memory;
pub mod ports;
pub mod regeneration;
pub mod scan_validator;

pub use access_control::{
    AccessControl, AccessControlSettings, Collaborators, ScanAttemptPage, SweepSummary,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use integrity::{IntegrityCoordinator, IntegrityPolicy, MockIntegrityAnchor};
pub use issuer::{resolve_expiry, CodeIssuer, IssueOptions, IssuedCode, IssuerPolicy};
pub use memory::{
    InMemoryAccessCodeStore, InMemoryAttendanceRecorder, InMemoryScanAttemptLog,
    StaticRegistrationDirectory,
};
pub use ports::{
    AccessCodeStore, AttendanceRecorder, EventBinding, IntegrityAnchor, Invalidation,
    RegistrationDirectory, ScanAttemptLog,
};
pub use regeneration::{Regenerated, RegenerationCoordinator};
pub use scan_validator::{ScanValidator, ValidationResult};
