//! Verification strategies and lifecycle hooks.
//!
//! A strategy decides whether a signal on a target's subscription should
//! trigger a unit job, and may run side effects around each toggle cycle.
//! The set of strategies is closed; configuration selects one by name.

pub mod session;
pub mod sleep;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::InhibitConfig;
use crate::domain::RawSignal;
use crate::logind::{LogindInhibitor, LogindSessions};
use session::SessionStrategy;
use sleep::SleepStrategy;

/// Hooks driven by the toggle orchestrator.
///
/// Every hook except `verify` defaults to a no-op. Errors returned from any
/// hook are fatal for the target.
#[async_trait]
pub trait Strategy: Send {
    /// Run once before the first cycle.
    async fn init(&mut self) -> Result<(), HookError> {
        Ok(())
    }

    /// Decide whether `signal` should trigger a job.
    async fn verify(&mut self, signal: &RawSignal) -> Result<bool, HookError>;

    /// Run before waiting for the first signal of each cycle.
    async fn before(&mut self) -> Result<(), HookError> {
        Ok(())
    }

    /// Run after the first job of a toggling cycle was dispatched.
    async fn after(&mut self) -> Result<(), HookError> {
        Ok(())
    }
}

/// Errors raised by strategy hooks.
#[derive(Error, Debug)]
pub enum HookError {
    #[error("empty signal arguments: {member} on {path}")]
    EmptyArguments { path: String, member: String },

    #[error("first argument of {member} is not a bool: {signature}")]
    NotBool { member: String, signature: String },

    #[error("expected {member}({expected}), got {got}")]
    Alternation {
        member: String,
        expected: bool,
        got: bool,
    },

    #[error("Failed to connect to logind: {0}")]
    Logind(#[source] zbus::Error),

    #[error("Hook used before init")]
    NotInitialized,

    #[error("Failed to grab sleep inhibitor lock: {0}")]
    Inhibit(#[source] zbus::Error),

    #[error("Error releasing inhibitor lock: {0}")]
    Release(#[source] nix::Error),
}

impl HookError {
    /// Returns true if the error means a signal did not have the expected shape.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::EmptyArguments { .. } | Self::NotBool { .. } | Self::Alternation { .. }
        )
    }
}

/// Built-in strategy names accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// `PrepareForSleep` handshake with an inhibitor lock.
    Sleep,
    /// Accept only signals for the current user's sessions.
    Session,
}

impl StrategyKind {
    /// Build the hooks for one target.
    ///
    /// `username` is the identity resolved at startup. Both variants open
    /// their own logind connection in `init`, apart from the subscription.
    pub fn build(self, username: &str, inhibit: &InhibitConfig) -> Hooks {
        match self {
            Self::Sleep => Hooks::Sleep(SleepStrategy::new(LogindInhibitor::new(inhibit.clone()))),
            Self::Session => {
                Hooks::Session(SessionStrategy::new(LogindSessions::new(), username))
            }
        }
    }
}

/// Hooks for one target, dispatched by variant.
pub enum Hooks {
    Sleep(SleepStrategy<LogindInhibitor>),
    Session(SessionStrategy<LogindSessions>),
}

#[async_trait]
impl Strategy for Hooks {
    async fn init(&mut self) -> Result<(), HookError> {
        match self {
            Self::Sleep(s) => s.init().await,
            Self::Session(s) => s.init().await,
        }
    }

    async fn verify(&mut self, signal: &RawSignal) -> Result<bool, HookError> {
        match self {
            Self::Sleep(s) => s.verify(signal).await,
            Self::Session(s) => s.verify(signal).await,
        }
    }

    async fn before(&mut self) -> Result<(), HookError> {
        match self {
            Self::Sleep(s) => s.before().await,
            Self::Session(s) => s.before().await,
        }
    }

    async fn after(&mut self) -> Result<(), HookError> {
        match self {
            Self::Sleep(s) => s.after().await,
            Self::Session(s) => s.after().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_violation_classification() {
        let err = HookError::Alternation {
            member: "PrepareForSleep".to_string(),
            expected: true,
            got: false,
        };
        assert!(err.is_protocol_violation());
        assert_eq!(err.to_string(), "expected PrepareForSleep(true), got false");

        assert!(!HookError::NotInitialized.is_protocol_violation());
    }

    #[test]
    fn test_strategy_kind_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            strategy: StrategyKind,
        }

        let parsed: Wrapper = toml::from_str(r#"strategy = "session""#).unwrap();
        assert_eq!(parsed.strategy, StrategyKind::Session);
        let parsed: Wrapper = toml::from_str(r#"strategy = "sleep""#).unwrap();
        assert_eq!(parsed.strategy, StrategyKind::Sleep);
    }
}
