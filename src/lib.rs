//! chatlane: routes chat messages and scheduled tasks to per-group agent
//! workers, one at a time per group under a global concurrency cap.

pub mod channels;
pub mod config;
pub mod error;
pub mod queue;
pub mod router;
pub mod tasks;
pub mod worker;
