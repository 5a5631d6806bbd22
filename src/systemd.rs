//! Unit jobs through the systemd manager `DBus` API.

use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;
use tracing::{debug, trace};
use zbus::zvariant::OwnedObjectPath;
use zbus::{Connection, proxy};

use crate::domain::{Direction, Scope};

/// Job mode: supersede any queued conflicting job for the same unit.
const JOB_MODE: &str = "replace";

#[proxy(
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1",
    interface = "org.freedesktop.systemd1.Manager"
)]
trait SystemdManager {
    async fn start_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    async fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    async fn subscribe(&self) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn job_removed(
        &self,
        id: u32,
        job: OwnedObjectPath,
        unit: String,
        result: String,
    ) -> zbus::Result<()>;
}

/// Terminal state of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Done,
    /// Any other result reported by the manager ("failed", "canceled", ...).
    Other(String),
}

impl JobResult {
    pub fn parse(result: &str) -> Self {
        if result == "done" {
            Self::Done
        } else {
            Self::Other(result.to_string())
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Done => "done",
            Self::Other(result) => result,
        }
    }
}

/// Errors submitting or tracking a job.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("failed to connect to systemd ({scope} manager): {source}")]
    Connect {
        scope: Scope,
        #[source]
        source: zbus::Error,
    },

    #[error("failed to {direction} unit: {source}")]
    Submit {
        direction: Direction,
        #[source]
        source: zbus::Error,
    },

    #[error("job signal stream ended before {job} finished")]
    JobLost { job: String },
}

impl DispatchError {
    /// Whether the connection should be discarded and reopened.
    fn is_connection_failure(&self) -> bool {
        match self {
            Self::Connect { .. } | Self::JobLost { .. } => true,
            Self::Submit { source, .. } => matches!(
                source,
                zbus::Error::InputOutput(_) | zbus::Error::Handshake(_)
            ),
        }
    }
}

/// Submits unit jobs and waits for their completion.
#[async_trait]
pub trait UnitDispatcher: Send {
    async fn dispatch(
        &mut self,
        unit: &str,
        direction: Direction,
        scope: Scope,
    ) -> Result<JobResult, DispatchError>;
}

/// Dispatcher talking to the real service manager.
///
/// Keeps one connection per scope and reopens it after a connection failure.
#[derive(Default)]
pub struct SystemdDispatcher {
    user: Option<SystemdManagerProxy<'static>>,
    system: Option<SystemdManagerProxy<'static>>,
}

impl SystemdDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, scope: Scope) -> &mut Option<SystemdManagerProxy<'static>> {
        match scope {
            Scope::User => &mut self.user,
            Scope::System => &mut self.system,
        }
    }

    async fn manager(
        &mut self,
        scope: Scope,
    ) -> Result<SystemdManagerProxy<'static>, DispatchError> {
        if let Some(manager) = self.slot(scope) {
            return Ok(manager.clone());
        }

        let connect = |source| DispatchError::Connect { scope, source };
        let conn = match scope {
            Scope::User => Connection::session().await,
            Scope::System => Connection::system().await,
        }
        .map_err(connect)?;

        let manager = SystemdManagerProxy::new(&conn).await.map_err(connect)?;
        // JobRemoved is only emitted to subscribed clients
        manager.subscribe().await.map_err(connect)?;
        debug!("Connected to {} manager", scope);

        *self.slot(scope) = Some(manager.clone());
        Ok(manager)
    }
}

#[async_trait]
impl UnitDispatcher for SystemdDispatcher {
    async fn dispatch(
        &mut self,
        unit: &str,
        direction: Direction,
        scope: Scope,
    ) -> Result<JobResult, DispatchError> {
        let manager = self.manager(scope).await?;
        let result = run_job(&manager, unit, direction).await;

        if let Err(ref e) = result
            && e.is_connection_failure()
        {
            debug!("Dropping {} manager connection", scope);
            *self.slot(scope) = None;
        }

        result
    }
}

/// Submit a job and wait for its `JobRemoved` signal.
async fn run_job(
    manager: &SystemdManagerProxy<'static>,
    unit: &str,
    direction: Direction,
) -> Result<JobResult, DispatchError> {
    let submit = |source| DispatchError::Submit { direction, source };

    // Listen before submitting so a fast job cannot finish unobserved
    let mut removed = manager.receive_job_removed().await.map_err(submit)?;

    let job = match direction {
        Direction::Start => manager.start_unit(unit, JOB_MODE).await,
        Direction::Stop => manager.stop_unit(unit, JOB_MODE).await,
    }
    .map_err(submit)?;
    trace!("Queued job {} ({} {})", job.as_str(), direction, unit);

    while let Some(signal) = removed.next().await {
        let Ok(args) = signal.args() else {
            continue;
        };
        if args.job() == &job {
            return Ok(JobResult::parse(args.result()));
        }
    }

    Err(DispatchError::JobLost {
        job: job.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_result_parse() {
        assert_eq!(JobResult::parse("done"), JobResult::Done);
        assert!(JobResult::parse("done").is_done());

        let failed = JobResult::parse("failed");
        assert!(!failed.is_done());
        assert_eq!(failed.as_str(), "failed");

        for result in ["canceled", "timeout", "dependency", "skipped"] {
            assert_eq!(JobResult::parse(result), JobResult::Other(result.to_string()));
        }
    }

    #[test]
    fn test_connection_failure_classification() {
        let lost = DispatchError::JobLost {
            job: "/org/freedesktop/systemd1/job/7".to_string(),
        };
        assert!(lost.is_connection_failure());

        let rejected = DispatchError::Submit {
            direction: Direction::Start,
            source: zbus::Error::Failure("Unit nope.target not found.".to_string()),
        };
        assert!(!rejected.is_connection_failure());
        assert!(rejected.to_string().starts_with("failed to start unit"));
    }
}
