use std::io;
use thiserror::Error;

/// Failures a backend reports to its caller. Decode anomalies and kernel
/// queue overflow are handled inside the decoders (drop, resync, rearm) and
/// never reach this type.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// `begin` could not acquire a kernel handle or install marks/filters.
    /// The caller must not enter `run`.
    #[error("{what}: {source}")]
    Setup {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    /// The kernel handle went bad mid-run: a short or negative read with no
    /// interruption to blame. Terminates the run loop.
    #[error("kernel event read failed: {0}")]
    Read(#[source] io::Error),

    /// The requested backend does not exist on this host.
    #[error("backend `{0}` is not supported on this platform")]
    Unsupported(&'static str),
}

impl MonitorError {
    pub(crate) fn setup(what: &'static str, source: io::Error) -> Self {
        MonitorError::Setup { what, source }
    }

    pub(crate) fn last_os(what: &'static str) -> Self {
        MonitorError::Setup {
            what,
            source: io::Error::last_os_error(),
        }
    }
}
