pub mod violation_models;

pub use violation_models::{
    Breakdown, NewViolation, StoreStatus, ViolationFilter, ViolationRecord, ViolationView,
    DEFAULT_STATUS, MAX_VIOLATION_COUNT, UNKNOWN_CAMERA,
};
