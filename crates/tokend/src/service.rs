//! Systemd service integration
//!
//! Implements the parts of the sd-notify protocol the daemon uses: readiness,
//! a one-line status visible in `systemctl status`, and the stopping notice.
//! Every call is a no-op when `NOTIFY_SOCKET` is not set.

use anyhow::{Context, Result};
use presence::LifecycleStatus;
use std::env;
use std::os::unix::net::UnixDatagram;
use tracing::{debug, info};

const NOTIFY_SOCKET: &str = "NOTIFY_SOCKET";

/// Notify systemd that the daemon is ready
pub fn notify_ready() -> Result<()> {
    if send(socket_path().as_deref(), "READY=1")? {
        info!("Notified systemd: service ready");
    }
    Ok(())
}

/// Notify systemd that the daemon begins shutting down
pub fn notify_stopping() -> Result<()> {
    if send(socket_path().as_deref(), "STOPPING=1")? {
        info!("Notified systemd: service stopping");
    }
    Ok(())
}

/// Send a custom status message to systemd
pub fn notify_status(status: &str) -> Result<()> {
    if send(socket_path().as_deref(), &format!("STATUS={}", status))? {
        debug!("Notified systemd: status = {}", status);
    }
    Ok(())
}

/// Check if running under systemd
pub fn is_systemd() -> bool {
    socket_path().is_some()
}

/// Status line describing the driver state and attached tokens
pub fn status_line(status: &LifecycleStatus, attached: usize) -> String {
    let mut line = format!(
        "Driver {} (session {}), {} token(s) attached",
        status.state, status.generation, attached
    );
    if let Some(error) = &status.last_error {
        line.push_str(&format!(", last error: {}", error));
    }
    line
}

fn socket_path() -> Option<String> {
    env::var(NOTIFY_SOCKET).ok()
}

/// Send one datagram; returns whether anything was sent
fn send(socket_path: Option<&str>, message: &str) -> Result<bool> {
    let Some(socket_path) = socket_path else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
        return Ok(false);
    };

    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(message.as_bytes(), socket_path)
        .with_context(|| format!("Failed to send '{}' to systemd", message))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Error;
    use model::{DriverError, LifecycleState};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_send_without_socket() {
        assert!(!send(None, "READY=1").unwrap());
    }

    #[test]
    fn test_send_delivers_datagram() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();

        assert!(send(path.to_str(), "STATUS=testing").unwrap());

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"STATUS=testing");
    }

    #[test]
    fn test_send_to_missing_socket_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.sock");
        assert!(send(path.to_str(), "READY=1").is_err());
    }

    #[test]
    fn test_status_line() {
        let mut status = LifecycleStatus {
            state: LifecycleState::Initialized,
            generation: 3,
            last_error: None,
        };
        assert_eq!(
            status_line(&status, 2),
            "Driver Initialized (session 3), 2 token(s) attached"
        );

        status.last_error = Some(Arc::new(Error::Driver(DriverError::DeviceRemoved)));
        assert!(status_line(&status, 0).contains("last error"));
    }
}
