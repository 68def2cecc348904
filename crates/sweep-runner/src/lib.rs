//! Bounded concurrent prefix search over a fixed-length keyspace.
//!
//! Each candidate prefix is handed to an external search tool; up to
//! `max_instances` tools run at once, the first output line carrying the
//! success marker wins, and a save request drains the pool and records the
//! next unlaunched index so a later run can resume there.

pub mod checkpoint;
pub mod config;
pub mod error;
mod fsutil;
pub mod job;
pub mod keyspace;
pub mod listener;
pub mod monitor;
pub mod scheduler;
pub mod signal;

pub use checkpoint::{CheckpointState, CheckpointStore};
pub use config::SweepConfig;
pub use error::{SweepError, SweepResult};
pub use job::{constraint_file_name, constraint_payload, Job, JobSettings};
pub use keyspace::Keyspace;
pub use listener::{spawn_listener, ListenerExit};
pub use scheduler::{Outcome, Scheduler, SweepReport};
pub use signal::{Coordinator, Observation, SuccessHit};
