//! Public traffic forwarding.
//!
//! The service's public listener accepts TCP connections and pipes each
//! one to whichever backend the `TrafficSwitch` points at when the
//! connection is accepted. Moving the switch never touches open
//! connections, which is what lets the old instance drain.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// The single live backend address.
#[derive(Debug, Clone, Default)]
pub struct TrafficSwitch {
    backend: Arc<RwLock<Option<SocketAddr>>>,
}

impl TrafficSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send all new connections to `addr`. Returns the previous backend.
    pub fn point_to(&self, addr: SocketAddr) -> Option<SocketAddr> {
        let mut backend = self.backend.write().expect("traffic switch lock");
        let previous = backend.replace(addr);
        info!(backend = %addr, previous = ?previous, "traffic switched");
        previous
    }

    /// Stop forwarding; new connections are refused.
    pub fn clear(&self) -> Option<SocketAddr> {
        self.backend.write().expect("traffic switch lock").take()
    }

    pub fn current(&self) -> Option<SocketAddr> {
        *self.backend.read().expect("traffic switch lock")
    }
}

/// Accept connections on `listener` and forward each to the current backend.
///
/// Runs until `shutdown` flips. Connections accepted while no backend is
/// live are closed immediately.
pub async fn serve_forwarder(
    listener: TcpListener,
    switch: TrafficSwitch,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "traffic forwarder listening");
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (inbound, peer) = accepted?;
                let Some(backend) = switch.current() else {
                    debug!(%peer, "no live instance, dropping connection");
                    continue;
                };
                tokio::spawn(async move {
                    if let Err(e) = forward(inbound, backend).await {
                        debug!(%peer, %backend, error = %e, "forwarded connection ended with error");
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("traffic forwarder shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn forward(mut inbound: TcpStream, backend: SocketAddr) -> std::io::Result<()> {
    let mut outbound = match TcpStream::connect(backend).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%backend, error = %e, "live instance refused connection");
            return Err(e);
        }
    };
    let (up, down) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await?;
    debug!(%backend, bytes_up = up, bytes_down = down, "connection closed");
    Ok(())
}
