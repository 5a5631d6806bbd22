//! Starts and stops systemd units in response to logind signals.
//!
//! Each configured target subscribes to a class of bus signals, filters them
//! through a verification strategy and runs a unit job for every accepted
//! signal. See [`toggle::Orchestrator`] for the control loop.

pub mod bus;
pub mod config;
pub mod domain;
pub mod logind;
pub mod notify;
pub mod strategy;
pub mod systemd;
pub mod toggle;
