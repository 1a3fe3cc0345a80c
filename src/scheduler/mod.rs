//! Cron-driven detection jobs.

pub mod cron;
pub mod engine;
pub mod history;

pub use self::cron::{DetectionJob, Scheduler};
pub use self::engine::{run_scheduler_loop, DetectionOutcome, DetectionRunner};
