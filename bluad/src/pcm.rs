//! PCM endpoint of a transport.
//!
//! An endpoint is the in-process side of the FIFO handed to a local
//! client. The descriptor slot is shared between the controller (which
//! installs and releases it) and the transport I/O task (which clones the
//! handle for the duration of one readiness cycle, so a concurrent release
//! never invalidates an in-flight read or write).

use std::sync::{Arc, Mutex};
use strum::{Display, EnumString};
use tokio::io::unix::AsyncFd;

use crate::{sock::OwnedFd, Error, ErrorKind, Result};

/// Direction of a PCM endpoint from the local client's perspective.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Display, EnumString)]
pub enum PcmMode {
    /// The client produces samples (writes into the FIFO).
    #[strum(serialize = "source")]
    Source,
    /// The client consumes samples (reads from the FIFO).
    #[strum(serialize = "sink")]
    Sink,
}

/// The in-process PCM side of a transport.
#[derive(Debug)]
pub struct PcmEndpoint {
    mode: PcmMode,
    fd: Mutex<Option<Arc<AsyncFd<OwnedFd>>>>,
}

impl PcmEndpoint {
    pub(crate) fn new(mode: PcmMode) -> Self {
        Self { mode, fd: Mutex::new(None) }
    }

    /// Direction of this endpoint.
    pub fn mode(&self) -> PcmMode {
        self.mode
    }

    /// True while a client holds the other end of the FIFO.
    pub fn is_open(&self) -> bool {
        self.fd.lock().unwrap().is_some()
    }

    /// Installs the internal FIFO descriptor; fails when already open.
    pub(crate) fn install(&self, fd: OwnedFd) -> Result<()> {
        let mut slot = self.fd.lock().unwrap();
        if slot.is_some() {
            return Err(Error::new(ErrorKind::Busy));
        }
        let fd = AsyncFd::new(fd).map_err(Error::from)?;
        *slot = Some(Arc::new(fd));
        Ok(())
    }

    /// A handle for one I/O cycle, or [None] when no client is connected.
    pub(crate) fn handle(&self) -> Option<Arc<AsyncFd<OwnedFd>>> {
        self.fd.lock().unwrap().clone()
    }

    /// Closes the internal descriptor. Returns whether it was open.
    pub(crate) fn close(&self) -> bool {
        self.fd.lock().unwrap().take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sock;

    #[tokio::test]
    async fn install_is_exclusive() {
        let ep = PcmEndpoint::new(PcmMode::Source);
        assert!(!ep.is_open());

        let (r, _w) = sock::pipe().unwrap();
        ep.install(r).unwrap();
        assert!(ep.is_open());

        let (r2, _w2) = sock::pipe().unwrap();
        let err = ep.install(r2).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Busy);

        assert!(ep.close());
        assert!(!ep.close());
        assert!(!ep.is_open());
    }

    #[tokio::test]
    async fn handle_survives_release() {
        let ep = PcmEndpoint::new(PcmMode::Sink);
        let (r, _w) = sock::pipe().unwrap();
        ep.install(r).unwrap();

        let handle = ep.handle().unwrap();
        ep.close();
        // the cloned handle keeps the descriptor alive for the holder
        assert!(ep.handle().is_none());
        drop(handle);
    }

    #[test]
    fn mode_strings() {
        assert_eq!(PcmMode::Source.to_string(), "source");
        assert_eq!("sink".parse::<PcmMode>().unwrap(), PcmMode::Sink);
        assert!("Sink".parse::<PcmMode>().is_err());
    }
}
