//! systemd-logind `DBus` access.
//!
//! Sleep inhibitor locks and session owner lookups.

use std::os::fd::IntoRawFd;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;
use zbus::zvariant::{OwnedFd, OwnedValue};
use zbus::{Connection, proxy};

use crate::config::InhibitConfig;
use crate::strategy::HookError;
use crate::strategy::session::SessionLookup;
use crate::strategy::sleep::SleepInhibitor;

/// `DBus` service and path for login1.
const LOGIND_SERVICE: &str = "org.freedesktop.login1";
const SESSION_INTERFACE: &str = "org.freedesktop.login1.Session";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

#[proxy(
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1",
    interface = "org.freedesktop.login1.Manager"
)]
trait LoginManager {
    async fn inhibit(&self, what: &str, who: &str, why: &str, mode: &str) -> zbus::Result<OwnedFd>;
}

/// Sleep inhibitor backed by logind's `Inhibit` call.
///
/// The returned fd is the lock; closing it lets the system sleep.
pub struct LogindInhibitor {
    settings: InhibitConfig,
    manager: Option<LoginManagerProxy<'static>>,
}

impl LogindInhibitor {
    pub fn new(settings: InhibitConfig) -> Self {
        Self {
            settings,
            manager: None,
        }
    }
}

#[async_trait]
impl SleepInhibitor for LogindInhibitor {
    type Lock = OwnedFd;

    async fn connect(&mut self) -> Result<(), HookError> {
        let conn = Connection::system().await.map_err(HookError::Logind)?;
        let manager = LoginManagerProxy::new(&conn)
            .await
            .map_err(HookError::Logind)?;
        debug!("Connected to logind");
        self.manager = Some(manager);
        Ok(())
    }

    async fn acquire(&mut self) -> Result<OwnedFd, HookError> {
        let manager = self.manager.as_ref().ok_or(HookError::NotInitialized)?;
        manager
            .inhibit(
                "sleep",
                &self.settings.who,
                &self.settings.why,
                &self.settings.mode,
            )
            .await
            .map_err(HookError::Inhibit)
    }

    fn release(&mut self, lock: OwnedFd) -> Result<(), HookError> {
        let fd: std::os::fd::OwnedFd = lock.into();
        nix::unistd::close(fd.into_raw_fd()).map_err(HookError::Release)
    }
}

/// Looks up session owners through logind session objects.
///
/// Holds a connection of its own. The target's subscription connection may
/// have unread signals queued, and replies on it would wait behind them.
#[derive(Default)]
pub struct LogindSessions {
    conn: Option<Connection>,
}

impl LogindSessions {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionLookup for LogindSessions {
    async fn connect(&mut self) -> Result<(), HookError> {
        let conn = Connection::system().await.map_err(HookError::Logind)?;
        debug!("Connected to logind for session lookups");
        self.conn = Some(conn);
        Ok(())
    }

    async fn session_user(&self, session_path: &str) -> Result<String> {
        let conn = self.conn.as_ref().ok_or(HookError::NotInitialized)?;
        get_session_name(conn, session_path).await
    }
}

/// Get the `Name` property (the owning user name) of a session.
async fn get_session_name(conn: &Connection, session_path: &str) -> Result<String> {
    let proxy = zbus::Proxy::new(conn, LOGIND_SERVICE, session_path, PROPERTIES_INTERFACE)
        .await
        .context("Failed to create Properties proxy")?;

    let value: OwnedValue = proxy
        .call("Get", &(SESSION_INTERFACE, "Name"))
        .await
        .with_context(|| format!("Failed to get Name property of {session_path}"))?;

    let name: String = value
        .try_into()
        .map_err(|_| anyhow::anyhow!("Session name is not a string"))?;

    Ok(name)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use zbus::connection::Builder;

    use super::*;
    use crate::bus::{BusSignalSource, SignalSource};
    use crate::domain::SignalFilter;

    const SESSION_PATH: &str = "/org/freedesktop/login1/session/_31";

    async fn connect_to(address: &str) -> Connection {
        Builder::address(address).unwrap().build().await.unwrap()
    }

    #[tokio::test]
    async fn test_lookup_before_connect_fails() {
        let sessions = LogindSessions::new();
        let err = sessions.session_user(SESSION_PATH).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HookError>(),
            Some(HookError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_lookup_not_blocked_by_signal_backlog() {
        let daemon = match dbus_launch::Launcher::daemon().launch() {
            Ok(daemon) => daemon,
            Err(e) => {
                eprintln!("Skipping: could not start dbus-daemon: {e}");
                return;
            }
        };

        // Subscription with a small queue, as a target would hold it
        let subscriber = connect_to(daemon.address()).await;
        let filter = SignalFilter {
            interface: Some(SESSION_INTERFACE.to_string()),
            member: Some("Lock".to_string()),
            ..SignalFilter::default()
        };
        let mut source = BusSignalSource::subscribe(&subscriber, &filter, 2)
            .await
            .unwrap();

        // Far more signals than the queues hold, none of them consumed yet
        let emitter = connect_to(daemon.address()).await;
        for _ in 0..30 {
            emitter
                .emit_signal(None::<&str>, SESSION_PATH, SESSION_INTERFACE, "Lock", &())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let signal = source.next_signal().await.unwrap();
        assert_eq!(signal.member, "Lock");

        // There is no logind on this bus, so the lookup itself fails; it
        // must fail promptly instead of waiting behind the backlog.
        let sessions = LogindSessions {
            conn: Some(connect_to(daemon.address()).await),
        };
        let lookup = tokio::time::timeout(
            Duration::from_secs(5),
            sessions.session_user(&signal.path),
        )
        .await;
        assert!(lookup.is_ok(), "session lookup stalled behind queued signals");
        assert!(lookup.unwrap().is_err());
    }
}
