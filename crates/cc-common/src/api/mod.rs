pub mod queue_views;

pub use queue_views::{JobStatusView, JobSummary, QueueStats};
