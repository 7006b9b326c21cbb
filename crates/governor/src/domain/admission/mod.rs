//! Quota- and priority-aware admission of workload requests

mod controller;
mod queue;
mod quota;
mod types;

pub use controller::AdmissionController;
pub use queue::FairShareQueue;
pub use queue::QueueKey;
pub use quota::Quota;
pub use quota::QuotaBook;
pub use types::*;
