//! Host port reservation for one protocol.
//!
//! A fountain task cycles through the ephemeral range forever, feeding a
//! bounded channel; automatic acquisition drinks from it until a candidate
//! is not in use. Explicit requests bypass the fountain entirely.

use std::collections::HashSet;

use tokio::sync::{mpsc, oneshot};

use crate::error::{NetworkError, NetworkResult};

/// First port served by automatic allocation.
pub const PORT_RANGE_START: u16 = 49153;
/// One past the last port served by automatic allocation.
pub const PORT_RANGE_END: u16 = 65535;

/// Port reservations for a single protocol (one for TCP, one for UDP).
pub struct PortAllocator {
    in_use: parking_lot::Mutex<HashSet<u16>>,
    fountain: tokio::sync::Mutex<mpsc::Receiver<u16>>,
    quit: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        let (quit_tx, quit_rx) = oneshot::channel();
        tokio::spawn(run_fountain(tx, quit_rx));
        Self {
            in_use: parking_lot::Mutex::new(HashSet::new()),
            fountain: tokio::sync::Mutex::new(rx),
            quit: parking_lot::Mutex::new(Some(quit_tx)),
        }
    }

    /// Reserve a port. `0` draws the next free port from the ephemeral
    /// range; anything else requests exactly that port and fails with
    /// [`NetworkError::PortInUse`] when it is taken.
    pub async fn acquire(&self, port: u16) -> NetworkResult<u16> {
        if port != 0 {
            tracing::debug!("acquiring explicit port {port}");
            return if self.try_reserve(port) {
                Ok(port)
            } else {
                Err(NetworkError::PortInUse { port })
            };
        }

        let mut fountain = self.fountain.lock().await;
        loop {
            match fountain.recv().await {
                Some(candidate) => {
                    if self.try_reserve(candidate) {
                        tracing::debug!("acquired port {candidate}");
                        return Ok(candidate);
                    }
                }
                None => return Err(NetworkError::AllocatorClosed),
            }
        }
    }

    /// Forget a reservation. Unknown ports are tolerated.
    pub fn release(&self, port: u16) {
        tracing::debug!("releasing port {port}");
        self.in_use.lock().remove(&port);
    }

    /// Stop the fountain. Idempotent; a blocked [`PortAllocator::acquire`]
    /// unblocks with [`NetworkError::AllocatorClosed`].
    pub fn close(&self) {
        self.quit.lock().take();
    }

    fn try_reserve(&self, port: u16) -> bool {
        self.in_use.lock().insert(port)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_fountain(tx: mpsc::Sender<u16>, mut quit: oneshot::Receiver<()>) {
    loop {
        for port in PORT_RANGE_START..PORT_RANGE_END {
            tokio::select! {
                _ = &mut quit => return,
                sent = tx.send(port) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
