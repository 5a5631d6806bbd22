//! Per-target control loop.
//!
//! ```text
//! init -> before -> await(initial) -> dispatch(initial)
//!           ^                              |
//!           |                         toggle? --no--> before
//!           |                              |
//!           +-- dispatch(reverse) <- await(reverse) <- after
//! ```
//!
//! Waiting for a signal only ends when the strategy accepts one; rejected
//! signals are dropped without side effects. Job failures are logged and the
//! loop carries on. Everything else ends the loop with a [`TargetError`].

use std::convert::Infallible;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, SignalSource};
use crate::config::Target;
use crate::domain::Direction;
use crate::strategy::{HookError, Strategy};
use crate::systemd::{JobResult, UnitDispatcher};

/// Errors that stop a target for good.
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("subscription failed: {0}")]
    Bus(#[from] BusError),

    #[error("unexpected signal: {0}")]
    Protocol(#[source] HookError),

    #[error("init hook failed: {0}")]
    Init(#[source] HookError),

    #[error("{0}")]
    Hook(#[source] HookError),

    #[error("signal stream closed")]
    SourceClosed,
}

impl TargetError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Bus(_) => 2,
            Self::Protocol(_) => 3,
            Self::Init(_) | Self::Hook(_) => 4,
            Self::SourceClosed => 5,
        }
    }

    fn from_verify(e: HookError) -> Self {
        if e.is_protocol_violation() {
            Self::Protocol(e)
        } else {
            Self::Hook(e)
        }
    }
}

/// Drives one target: signals in, unit jobs out.
pub struct Orchestrator<S, V, D> {
    target: Target,
    source: S,
    strategy: V,
    dispatcher: D,
}

impl<S, V, D> Orchestrator<S, V, D>
where
    S: SignalSource,
    V: Strategy,
    D: UnitDispatcher,
{
    pub fn new(target: Target, source: S, strategy: V, dispatcher: D) -> Self {
        Self {
            target,
            source,
            strategy,
            dispatcher,
        }
    }

    /// Run until a fatal error occurs.
    pub async fn run(mut self) -> Result<Infallible, TargetError> {
        self.strategy.init().await.map_err(TargetError::Init)?;
        info!(
            "Listening for {} signals ({})",
            self.target.unit, self.target.filter
        );

        let initial = self.target.initial;
        loop {
            self.strategy.before().await.map_err(TargetError::Hook)?;

            self.await_signal(initial).await?;
            self.dispatch(initial).await;

            if !self.target.toggle {
                continue;
            }

            self.strategy.after().await.map_err(TargetError::Hook)?;

            self.await_signal(initial.reverse()).await?;
            self.dispatch(initial.reverse()).await;
        }
    }

    /// Wait until the strategy accepts a signal.
    async fn await_signal(&mut self, direction: Direction) -> Result<(), TargetError> {
        debug!("Waiting for {} signal", direction);
        loop {
            let signal = self
                .source
                .next_signal()
                .await
                .ok_or(TargetError::SourceClosed)?;

            if self
                .strategy
                .verify(&signal)
                .await
                .map_err(TargetError::from_verify)?
            {
                return Ok(());
            }

            debug!("Rejected {} on {}", signal.member, signal.path);
        }
    }

    /// Run one job. Failures are logged, never fatal.
    async fn dispatch(&mut self, direction: Direction) {
        let unit = &self.target.unit;
        let scope = self.target.scope;

        match self.dispatcher.dispatch(unit, direction, scope).await {
            Ok(JobResult::Done) => {
                info!(
                    "Handled systemd unit: {} (scope: {}, {})",
                    unit, scope, direction
                );
            }
            Ok(result) => {
                warn!(
                    "Failed to handle unit {} (scope: {}, {}): {}",
                    unit,
                    scope,
                    direction,
                    result.as_str()
                );
            }
            Err(e) => {
                error!("Error handling target {}: {}", unit, e);
            }
        }
    }
}
