//! Monitoring subsystem: freshness of published data, worker liveness, and
//! the coordinator that combines both into a reliability verdict.
//!
//! `freshness` stamps and classifies what the refresh cycle publishes.
//! `watchdog` finds the worker pid and restarts it through `worker`.
//! `reliability` runs both checks, decides a verdict, and recovers.

pub mod freshness;
pub mod reliability;
pub mod watchdog;
pub mod worker;
