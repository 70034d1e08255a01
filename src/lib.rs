//! Vigil - check gating, execution, acknowledgement and escalation engine.

pub mod ack;
pub mod clock;
pub mod config;
pub mod counter;
pub mod db;
pub mod executor;
pub mod notify;
pub mod probe;
pub mod run_window;
pub mod scheduler;
pub mod service;
