// Background Jobs
//
// Time-driven sweeps: delay-node resumption, pool redistribution, check-in
// timeouts, and outbox delivery. All cross-invocation state lives in the
// database, so every sweep is safe to double-fire.

pub mod scheduler;

pub use scheduler::{JobConfig, JobError, JobScheduler};
