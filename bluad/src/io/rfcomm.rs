//! RFCOMM control-plane proxy.
//!
//! An RFCOMM sub-transport forwards AT traffic between the serial stream
//! handed over by the host stack and the SEQPACKET handler socket a local
//! client obtains through the bus. Without a handler, incoming bytes are
//! discarded.

use std::sync::Arc;
use tokio::io::unix::AsyncFd;

use crate::{
    io::Exit,
    sock::{self, OwnedFd},
    transport::{Transport, TransportKind},
};

async fn readable_opt(fd: Option<&Arc<AsyncFd<OwnedFd>>>) {
    match fd {
        Some(fd) => {
            let _ = fd.readable().await;
        }
        None => std::future::pending().await,
    }
}

/// Writes a whole buffer; returns false when the other side is gone.
async fn forward(fd: &AsyncFd<OwnedFd>, mut buf: &[u8]) -> bool {
    while !buf.is_empty() {
        let mut guard = match fd.writable().await {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        match guard.try_io(|inner| sock::write(inner.get_ref(), buf)) {
            Ok(Ok(n)) => buf = &buf[n..],
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Ok(Err(_)) => return false,
            Err(_would_block) => continue,
        }
    }
    true
}

pub(super) async fn run(t: Arc<Transport>) -> Exit {
    let Some(mut sig_rx) = t.take_signal_receiver() else {
        return Exit::Error;
    };

    let mut buf = [0u8; 1024];

    loop {
        if t.shutting_down() {
            return Exit::Shutdown;
        }

        let stream = t.bt_socket();
        let handler = match &t.kind {
            TransportKind::Rfcomm { handler, .. } => handler.lock().unwrap().clone(),
            _ => None,
        };

        enum Wake {
            Signal,
            Closed,
            Stream,
            Handler,
        }
        let wake = tokio::select! {
            sig = sig_rx.recv() => if sig.is_some() { Wake::Signal } else { Wake::Closed },
            () = readable_opt(stream.as_ref()) => Wake::Stream,
            () = readable_opt(handler.as_ref()) => Wake::Handler,
        };

        match wake {
            Wake::Closed => return Exit::Shutdown,
            Wake::Signal => continue,
            Wake::Stream => {
                let Some(stream) = stream else { continue };
                let mut guard = match stream.readable().await {
                    Ok(guard) => guard,
                    Err(_) => return Exit::Error,
                };
                match guard.try_io(|inner| sock::read(inner.get_ref(), &mut buf)) {
                    Ok(Ok(0)) => {
                        log::debug!("{}: RFCOMM stream closed", &t.path);
                        t.clear_bt_socket();
                        return Exit::PeerGone;
                    }
                    Ok(Ok(n)) => {
                        if let Some(handler) = &handler {
                            if !forward(handler, &buf[..n]).await {
                                if let TransportKind::Rfcomm { handler, .. } = &t.kind {
                                    *handler.lock().unwrap() = None;
                                }
                            }
                        } else {
                            log::trace!("{}: discarding {} RFCOMM bytes", &t.path, n);
                        }
                    }
                    Ok(Err(err))
                        if matches!(
                            err.raw_os_error(),
                            Some(libc::ECONNRESET) | Some(libc::ENOTCONN)
                        ) =>
                    {
                        t.clear_bt_socket();
                        return Exit::PeerGone;
                    }
                    Ok(Err(err)) => log::error!("RFCOMM read error: {err}"),
                    Err(_would_block) => (),
                }
            }
            Wake::Handler => {
                let Some(handler_fd) = handler else { continue };
                let mut guard = match handler_fd.readable().await {
                    Ok(guard) => guard,
                    Err(_) => continue,
                };
                match guard.try_io(|inner| sock::read(inner.get_ref(), &mut buf)) {
                    Ok(Ok(0)) => {
                        log::debug!("{}: RFCOMM handler closed", &t.path);
                        if let TransportKind::Rfcomm { handler, .. } = &t.kind {
                            *handler.lock().unwrap() = None;
                        }
                    }
                    Ok(Ok(n)) => {
                        if let Some(stream) = &stream {
                            let _ = forward(stream, &buf[..n]).await;
                        }
                    }
                    Ok(Err(err)) => log::error!("RFCOMM handler read error: {err}"),
                    Err(_would_block) => (),
                }
            }
        }
    }
}
