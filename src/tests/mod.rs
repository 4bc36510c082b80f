//! # Unit and integration tests
//!
//! Tests are organized by component and cover the observable
//! guarantees: exclusivity and concurrency caps, cooldown and flap
//! accounting, retry/backoff arithmetic, notification priorities and
//! retries, and supervisor lifecycle including degraded mode.

pub mod notification_tests;
pub mod recovery_tests;
