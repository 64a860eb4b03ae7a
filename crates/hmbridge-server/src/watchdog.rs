//! Service-manager liveness signaling.
//!
//! Sends `sd_notify` datagrams (`READY=1`, `WATCHDOG=1`, `STATUS=...`,
//! `STOPPING=1`) to the socket named by `NOTIFY_SOCKET`. Without that
//! variable every call is a no-op returning `false`.

use std::io;
use tokio::time::{sleep, Duration};

/// Interval used when neither the config nor `WATCHDOG_USEC` sets one.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Sends `message` to the notify socket at `path`. A leading `@` selects
/// the Linux abstract namespace.
///
/// # Errors
///
/// Returns the socket error if the datagram cannot be sent.
#[cfg(unix)]
pub fn notify_socket(path: &str, message: &str) -> io::Result<()> {
    use std::os::unix::net::UnixDatagram;

    let socket = UnixDatagram::unbound()?;
    if let Some(name) = path.strip_prefix('@') {
        #[cfg(target_os = "linux")]
        {
            use std::os::linux::net::SocketAddrExt;
            let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
            socket.send_to_addr(message.as_bytes(), &addr)?;
            return Ok(());
        }
        #[cfg(not(target_os = "linux"))]
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("abstract notify socket {name} requires Linux"),
        ));
    }
    socket.send_to(message.as_bytes(), path)?;
    Ok(())
}

#[cfg(not(unix))]
pub fn notify_socket(_path: &str, _message: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "notify sockets require a unix platform",
    ))
}

/// Sends `message` to `NOTIFY_SOCKET`. Returns whether it was delivered.
pub fn notify(message: &str) -> bool {
    let Some(path) = std::env::var("NOTIFY_SOCKET").ok().filter(|p| !p.is_empty()) else {
        return false;
    };
    match notify_socket(&path, message) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(socket = %path, error = %e, "service manager notification failed");
            false
        }
    }
}

pub fn ready() -> bool {
    notify("READY=1")
}

pub fn watchdog() -> bool {
    notify("WATCHDOG=1")
}

pub fn status(line: &str) -> bool {
    notify(&format!("STATUS={line}"))
}

pub fn stopping() -> bool {
    notify("STOPPING=1")
}

/// Picks the ping interval: the configured value, else half of
/// `WATCHDOG_USEC`, else 30 seconds.
pub fn watchdog_interval(configured_secs: Option<u64>, watchdog_usec: Option<&str>) -> Duration {
    if let Some(secs) = configured_secs.filter(|s| *s > 0) {
        return Duration::from_secs(secs);
    }
    watchdog_usec
        .and_then(|usec| usec.trim().parse::<u64>().ok())
        .filter(|usec| *usec > 0)
        .map(|usec| Duration::from_micros(usec / 2).max(Duration::from_secs(1)))
        .unwrap_or(DEFAULT_INTERVAL)
}

/// Sends `WATCHDOG=1` every `interval`. Runs until the task is dropped.
pub async fn start_watchdog_task(interval: Duration) {
    if std::env::var_os("NOTIFY_SOCKET").is_none() {
        tracing::debug!("NOTIFY_SOCKET not set, watchdog pings disabled");
        return;
    }

    tracing::info!(interval_secs = interval.as_secs(), "starting watchdog task");

    loop {
        sleep(interval).await;
        if !watchdog() {
            tracing::debug!("watchdog ping not delivered");
        }
    }
}
