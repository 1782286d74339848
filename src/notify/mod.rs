//! Notice delivery: job state machine, dispatcher worker and message templates.

mod dispatcher;
mod job;
pub mod templates;

pub use dispatcher::{Clock, DeliveryReport, DispatchConfig, Dispatcher, SystemClock};
pub use job::{
    validate_recipient, BatchOutcome, DispatchStats, JobId, JobStatus, NotificationJob,
    NotificationKind, Payload, PendingJob,
};
pub use templates::{FineReceipt, NoticeSettings};
