//! Service notification for `Type=notify` services.
//!
//! With the `systemd` feature, notifications go through libsystemd's
//! `sd_notify`. Without it, the datagram is written to `$NOTIFY_SOCKET`
//! directly.
//! See: <https://www.freedesktop.org/software/systemd/man/sd_notify.html>

use anyhow::Result;

/// Tell the service manager that startup finished.
///
/// Returns `Ok(false)` if not running under a notify-aware supervisor.
pub fn ready() -> Result<bool> {
    notify("READY", "1")
}

/// Tell the service manager that shutdown began.
pub fn stopping() -> Result<bool> {
    notify("STOPPING", "1")
}

#[cfg(feature = "systemd")]
fn notify(key: &str, value: &str) -> Result<bool> {
    let state = [(key, value)];
    Ok(systemd::daemon::notify(false, state.iter())?)
}

#[cfg(not(feature = "systemd"))]
fn notify(key: &str, value: &str) -> Result<bool> {
    let Some(socket) = std::env::var_os("NOTIFY_SOCKET") else {
        return Ok(false);
    };

    let addr = datagram::notify_addr(&socket)?;
    datagram::send_state(&addr, &format!("{key}={value}"))?;
    Ok(true)
}

/// sd_notify wire protocol over a unix datagram socket.
#[cfg(not(feature = "systemd"))]
mod datagram {
    use std::ffi::OsStr;
    use std::os::fd::AsRawFd;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use anyhow::{Context, Result};
    use nix::sys::socket::{
        AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr, sendto, socket,
    };

    /// Parse a `NOTIFY_SOCKET` value; a leading '@' names an abstract socket.
    pub(super) fn notify_addr(socket: &OsStr) -> Result<UnixAddr> {
        let bytes = socket.as_bytes();
        match bytes.first() {
            Some(b'@') => UnixAddr::new_abstract(&bytes[1..])
                .with_context(|| format!("Invalid abstract NOTIFY_SOCKET: {socket:?}")),
            Some(b'/') => UnixAddr::new(Path::new(socket))
                .with_context(|| format!("Invalid NOTIFY_SOCKET path: {socket:?}")),
            _ => anyhow::bail!("Unsupported NOTIFY_SOCKET: {socket:?}"),
        }
    }

    pub(super) fn send_state(addr: &UnixAddr, state: &str) -> Result<()> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .context("Failed to create notify socket")?;

        sendto(fd.as_raw_fd(), state.as_bytes(), addr, MsgFlags::empty())
            .context("Failed to send notification")?;
        Ok(())
    }

}
