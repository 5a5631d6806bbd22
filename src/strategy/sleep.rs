//! `PrepareForSleep` handshake.
//!
//! logind emits `PrepareForSleep(true)` before suspending and
//! `PrepareForSleep(false)` after resuming. A delay inhibitor lock is held
//! while waiting for the first one so the unit can start before the system
//! goes down, and released once the start job has finished.

use async_trait::async_trait;
use tracing::{debug, info};

use super::{HookError, Strategy};
use crate::domain::RawSignal;

/// Source of sleep inhibitor locks.
#[async_trait]
pub trait SleepInhibitor: Send {
    /// Held lock; sleep is delayed until it is released.
    type Lock: Send;

    /// Open the connection used for later `acquire` calls.
    async fn connect(&mut self) -> Result<(), HookError>;

    async fn acquire(&mut self) -> Result<Self::Lock, HookError>;

    fn release(&mut self, lock: Self::Lock) -> Result<(), HookError>;
}

/// Strategy enforcing strict true/false alternation of `PrepareForSleep`.
pub struct SleepStrategy<I: SleepInhibitor> {
    inhibitor: I,
    lock: Option<I::Lock>,

    /// Argument expected on the next signal.
    want: bool,
}

impl<I: SleepInhibitor> SleepStrategy<I> {
    pub fn new(inhibitor: I) -> Self {
        Self {
            inhibitor,
            lock: None,
            want: true,
        }
    }

    /// Argument the next signal must carry.
    #[cfg(test)]
    fn expected(&self) -> bool {
        self.want
    }

    /// Whether an inhibitor lock is currently held.
    #[cfg(test)]
    fn holds_lock(&self) -> bool {
        self.lock.is_some()
    }

    fn check(&mut self, signal: &RawSignal) -> Result<(), HookError> {
        let Some(first) = signal.args.first() else {
            return Err(HookError::EmptyArguments {
                path: signal.path.clone(),
                member: signal.member.clone(),
            });
        };

        let got = first
            .downcast_ref::<bool>()
            .map_err(|_| HookError::NotBool {
                member: signal.member.clone(),
                signature: first.value_signature().to_string(),
            })?;

        if got != self.want {
            return Err(HookError::Alternation {
                member: signal.member.clone(),
                expected: self.want,
                got,
            });
        }

        self.want = !self.want;
        Ok(())
    }
}

#[async_trait]
impl<I: SleepInhibitor> Strategy for SleepStrategy<I> {
    async fn init(&mut self) -> Result<(), HookError> {
        self.inhibitor.connect().await
    }

    async fn verify(&mut self, signal: &RawSignal) -> Result<bool, HookError> {
        self.check(signal)?;
        debug!("{}({}) accepted", signal.member, !self.want);
        Ok(true)
    }

    async fn before(&mut self) -> Result<(), HookError> {
        if self.lock.is_some() {
            debug!("Sleep inhibitor lock already held");
            return Ok(());
        }
        self.lock = Some(self.inhibitor.acquire().await?);
        info!("Got lock on sleep inhibitor");
        Ok(())
    }

    async fn after(&mut self) -> Result<(), HookError> {
        if let Some(lock) = self.lock.take() {
            self.inhibitor.release(lock)?;
            debug!("Released sleep inhibitor lock");
        }
        Ok(())
    }
}
