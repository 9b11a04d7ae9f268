//! Operator-initiated abort shared by the session driver and the prober.
//!
//! Cancelling flips a flag that every loop checks between suspension points and
//! shuts down every registered socket, so a read blocked on a silent server
//! returns immediately instead of waiting for its own timeout.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    sockets: Mutex<Vec<(u64, TcpStream)>>,
}

impl Inner {
    fn sockets(&self) -> MutexGuard<'_, Vec<(u64, TcpStream)>> {
        self.sockets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let sockets = {
            // flag and registry change under one lock so `register` sees both or neither
            let mut registry = self.inner.sockets();
            if self.inner.cancelled.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *registry)
        };
        tracing::info!(sockets = sockets.len(), "cancellation requested");
        for (_, socket) in sockets {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Tracks `stream` until the returned guard is dropped. A stream registered
    /// after cancellation is shut down on the spot.
    pub(crate) fn register(&self, stream: &TcpStream) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        match stream.try_clone() {
            Ok(clone) => {
                let mut registry = self.inner.sockets();
                if self.is_cancelled() {
                    drop(registry);
                    let _ = clone.shutdown(Shutdown::Both);
                } else {
                    registry.push((id, clone));
                }
            }
            Err(err) => tracing::warn!(error = %err, "socket not cancellable"),
        }
        Registration {
            id,
            token: self.clone(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Registration {
    id: u64,
    token: CancelToken,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.token
            .inner
            .sockets()
            .retain(|(id, _)| *id != self.id);
    }
}
