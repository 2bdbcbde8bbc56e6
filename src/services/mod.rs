pub mod analytics;
pub mod submission;

pub use analytics::{AggregationWindow, AnalyticsService};
pub use submission::{SubmissionService, ViolationSubmission};
