//! TCP relay in front of the active replica
//!
//! Players always connect to the same well-known port. The proxy forwards each
//! accepted connection to whatever backend the session last published on the
//! target watch channel. An empty target means "nobody to forward to", and
//! connections are closed as soon as they are accepted.
//!
//! The listener is re-created on every target change. New connections may fail
//! during that short window, but relays that are already running keep going:
//! they own their sockets and never look at the target again.

use crate::utils::retry_delay;
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Default Minecraft server port, used both for listening and for dialing backends
pub const GAME_PORT: u16 = 25565;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: String,
    pub backend_port: u16,
    pub retry: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", GAME_PORT),
            backend_port: GAME_PORT,
            retry: Duration::from_secs(1),
        }
    }
}

/// Closes a relayed connection pair exactly once, whichever direction
/// finishes first
#[derive(Debug, Default)]
pub struct CloseGuard {
    closed: AtomicBool,
    token: CancellationToken,
}

impl CloseGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only for the first caller
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.token.cancel();
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn closed(&self) {
        self.token.cancelled().await
    }
}

enum Outcome {
    Retarget,
    AcceptFailed,
    Shutdown,
}

pub struct Proxy {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    backend_port: u16,
    retry: Duration,
    target: watch::Receiver<String>,
}

impl Proxy {
    /// Binds the listening socket up front so a busy port fails at startup
    pub async fn bind(config: &ProxyConfig, target: watch::Receiver<String>) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.listen).await?;
        let local_addr = listener.local_addr()?;
        info!("Proxy listening on {}", local_addr);

        Ok(Self {
            listener: Some(listener),
            local_addr,
            backend_port: config.backend_port,
            retry: config.retry,
            target,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts and relays connections until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let listener = match self.listener.take() {
                Some(listener) => listener,
                None => match self.rebind(&shutdown).await {
                    Some(listener) => listener,
                    None => return,
                },
            };

            let target = self.target.borrow_and_update().clone();
            if target.is_empty() {
                info!("Proxy has no target, refusing connections");
            } else {
                info!("Proxy forwarding to {}:{}", target, self.backend_port);
            }

            let outcome = self.accept_loop(&listener, &target, &shutdown).await;
            drop(listener);

            match outcome {
                Outcome::Shutdown => {
                    info!("Proxy closed listener on {}", self.local_addr);
                    return;
                }
                Outcome::Retarget => {}
                Outcome::AcceptFailed => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(retry_delay(self.retry)) => {}
                    }
                }
            }
        }
    }

    async fn accept_loop(
        &mut self,
        listener: &TcpListener,
        target: &str,
        shutdown: &CancellationToken,
    ) -> Outcome {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Outcome::Shutdown,
                changed = self.target.changed() => {
                    if changed.is_err() {
                        debug!("Proxy target sender dropped");
                        return Outcome::Shutdown;
                    }
                    return Outcome::Retarget;
                }
                accepted = listener.accept() => match accepted {
                    Ok((inbound, peer)) => self.dispatch(inbound, peer, target),
                    Err(e) => {
                        warn!("Error accepting connection: {}", e);
                        return Outcome::AcceptFailed;
                    }
                },
            }
        }
    }

    async fn rebind(&self, shutdown: &CancellationToken) -> Option<TcpListener> {
        loop {
            match TcpListener::bind(self.local_addr).await {
                Ok(listener) => return Some(listener),
                Err(e) => error!("Failed to rebind {}: {}", self.local_addr, e),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(retry_delay(self.retry)) => {}
            }
        }
    }

    fn dispatch(&self, inbound: TcpStream, peer: SocketAddr, target: &str) {
        if target.is_empty() {
            debug!("Closing {}: no active backend", peer);
            return;
        }
        let backend = format!("{}:{}", target, self.backend_port);
        tokio::spawn(relay(inbound, peer, backend));
    }
}

/// Dials the backend and pumps bytes both ways until either side is done
async fn relay(inbound: TcpStream, peer: SocketAddr, backend: String) {
    let outbound = match TcpStream::connect(&backend).await {
        Ok(outbound) => outbound,
        Err(e) => {
            warn!("Failed to connect {} to {}: {}", peer, backend, e);
            return;
        }
    };
    info!("{} -> {}", peer, backend);

    let guard = Arc::new(CloseGuard::new());
    let (inbound_read, inbound_write) = inbound.into_split();
    let (outbound_read, outbound_write) = outbound.into_split();

    tokio::spawn(pipe(outbound_read, inbound_write, Arc::clone(&guard)));
    pipe(inbound_read, outbound_write, guard).await;
    debug!("{} -> {} closed", peer, backend);
}

/// Copies one direction; the first direction to finish closes both
async fn pipe<R, W>(mut from: R, mut to: W, guard: Arc<CloseGuard>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        result = tokio::io::copy(&mut from, &mut to) => {
            if let Err(e) = result {
                debug!("Relay error: {}", e);
            }
        }
        _ = guard.closed() => {}
    }
    guard.close();
}
