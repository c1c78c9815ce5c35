//! Accept error handling shared by the RPC server and the gateway
//!
//! Errors that belong to a single connection are skipped. Running out of
//! descriptors or buffers is temporary, so the listener backs off and tries
//! again instead of taking the daemon down. Anything else means the listener
//! itself is broken.

use std::io;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MIN_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

// ENFILE, EMFILE, ENOBUFS
#[cfg(target_os = "linux")]
const RESOURCE_ERRNOS: [i32; 3] = [23, 24, 105];
#[cfg(all(unix, not(target_os = "linux")))]
const RESOURCE_ERRNOS: [i32; 3] = [23, 24, 55];
// WSAEMFILE, WSAENOBUFS
#[cfg(windows)]
const RESOURCE_ERRNOS: [i32; 2] = [10024, 10055];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcceptError {
    /// One connection failed; accept the next one right away
    Connection,
    /// Out of resources; wait before accepting again
    Exhausted,
    /// The listener cannot accept anymore
    Fatal,
}

pub(crate) fn classify(err: &io::Error) -> AcceptError {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => AcceptError::Connection,
        io::ErrorKind::OutOfMemory => AcceptError::Exhausted,
        _ => match err.raw_os_error() {
            Some(code) if RESOURCE_ERRNOS.contains(&code) => AcceptError::Exhausted,
            _ => AcceptError::Fatal,
        },
    }
}

/// Doubling delay between accepts while resources are exhausted
#[derive(Debug, Default)]
pub(crate) struct AcceptBackoff {
    delay: Option<Duration>,
}

impl AcceptBackoff {
    pub fn reset(&mut self) {
        self.delay = None;
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.delay {
            None => MIN_BACKOFF,
            Some(delay) => (delay * 2).min(MAX_BACKOFF),
        };
        self.delay = Some(delay);
        delay
    }

    /// Deal with a failed accept
    ///
    /// Returns `Ok` when the accept loop should carry on, after sleeping if
    /// needed. The sleep ends early when `cancel` fires.
    pub async fn on_error(
        &mut self,
        err: io::Error,
        listener: &'static str,
        cancel: &CancellationToken,
    ) -> io::Result<()> {
        match classify(&err) {
            AcceptError::Connection => {
                debug!(listener, error = %err, "Failed to accept connection");
                Ok(())
            }
            AcceptError::Exhausted => {
                let delay = self.next_delay();
                warn!(
                    listener,
                    error = %err,
                    retry_ms = delay.as_millis() as u64,
                    "Out of resources accepting connections, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
                Ok(())
            }
            AcceptError::Fatal => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_classify_accept_errors() {
        assert_eq!(
            classify(&io::Error::from(io::ErrorKind::ConnectionAborted)),
            AcceptError::Connection
        );
        assert_eq!(
            classify(&io::Error::from(io::ErrorKind::Interrupted)),
            AcceptError::Connection
        );
        assert_eq!(
            classify(&io::Error::from(io::ErrorKind::OutOfMemory)),
            AcceptError::Exhausted
        );
        for code in RESOURCE_ERRNOS {
            assert_eq!(
                classify(&io::Error::from_raw_os_error(code)),
                AcceptError::Exhausted,
                "os error {code}"
            );
        }
        assert_eq!(
            classify(&io::Error::from(io::ErrorKind::InvalidInput)),
            AcceptError::Fatal
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_too_many_open_files_is_temporary() {
        let err = io::Error::from_raw_os_error(24);
        assert!(err.to_string().contains("Too many open files"));
        assert_eq!(classify(&err), AcceptError::Exhausted);
    }

    #[test]
    fn test_backoff_doubles_up_to_cap_and_resets() {
        let mut backoff = AcceptBackoff::default();

        assert_eq!(backoff.next_delay(), MIN_BACKOFF);
        assert_eq!(backoff.next_delay(), MIN_BACKOFF * 2);
        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), MAX_BACKOFF);

        backoff.reset();
        assert_eq!(backoff.next_delay(), MIN_BACKOFF);
    }

    #[tokio::test]
    async fn test_exhaustion_keeps_listener_alive() {
        let cancel = CancellationToken::new();
        let mut backoff = AcceptBackoff::default();

        for _ in 0..3 {
            let err = io::Error::from_raw_os_error(RESOURCE_ERRNOS[0]);
            assert!(backoff.on_error(err, "rpc", &cancel).await.is_ok());
        }

        let err = io::Error::from(io::ErrorKind::InvalidInput);
        assert!(backoff.on_error(err, "rpc", &cancel).await.is_err());
    }

    #[tokio::test]
    async fn test_backoff_sleep_ends_on_cancel() {
        let cancel = CancellationToken::new();
        let mut backoff = AcceptBackoff {
            delay: Some(MAX_BACKOFF),
        };
        cancel.cancel();

        let started = Instant::now();
        let err = io::Error::from(io::ErrorKind::OutOfMemory);
        backoff.on_error(err, "rest", &cancel).await.unwrap();
        assert!(started.elapsed() < MAX_BACKOFF);
    }
}
