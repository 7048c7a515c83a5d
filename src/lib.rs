//! Turnstile - Admission Control for Multi-Tenant Job Intake
//!
//! This crate decides, for every submitted job, whether it may run now. A job
//! is checked against a versioned policy: a priority gate, an idempotency
//! window and token-bucket quotas for global throughput, each tenant and each
//! downstream dependency. All quota buckets a job touches are charged in one
//! atomic store operation, so concurrent checks never over-admit.

pub mod admission;
pub mod config;
pub mod error;
pub mod intake;
pub mod policy;
pub mod reload;
pub mod store;
