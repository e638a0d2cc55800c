//! The dispatcher: binds the listening socket and spawns one session task
//! per accepted connection.

use crate::registry::StorageRegistry;
use crate::session::{ClientRegistry, Session};
use crate::error::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Shared state reachable from every session: the open-database map, the
/// connected-client set, and the shutdown signal raised by `Q`.
pub struct ServerState {
    pub registry: StorageRegistry,
    pub clients: ClientRegistry,
    shutdown: Notify,
}

impl ServerState {
    pub fn new(root: PathBuf) -> Self {
        Self {
            registry: StorageRegistry::new(root),
            clients: ClientRegistry::new(),
            shutdown: Notify::new(),
        }
    }

    fn request_shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

/// A small backlog is adequate for this server: connections are expected
/// to be long-lived application clients, not a request-per-connection
/// workload.
const LISTEN_BACKLOG_HINT: u32 = 16;

pub struct Dispatcher {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Dispatcher {
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn bind(addr: &str, root: PathBuf) -> Result<Self> {
        let _ = LISTEN_BACKLOG_HINT; // tokio's TcpListener has no backlog knob to pass this to
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, root = %root.display(), "durusd listening");
        Ok(Self {
            listener,
            state: Arc::new(ServerState::new(root)),
        })
    }

    /// Accepts connections until a client sends `Q`.
    pub async fn run(self) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (socket, peer) = accepted?;
                    let client = self.state.clients.register();
                    let client_id = client.id;
                    let state = self.state.clone();
                    info!(client_id, %peer, "client connected");

                    tokio::spawn(async move {
                        let mut session = Session::new(socket, client, state.clone());
                        let outcome = session.run().await;
                        state.clients.remove(client_id);
                        match outcome {
                            Ok(true) => {
                                info!(client_id, "quit received");
                                state.request_shutdown();
                            }
                            Ok(false) => info!(client_id, "client disconnected"),
                            Err(e) => warn!(client_id, error = %e, "session terminated"),
                        }
                    });
                }
                _ = self.state.shutdown.notified() => {
                    info!("stopping dispatcher");
                    self.state.registry.close_all().await?;
                    return Ok(());
                }
            }
        }
    }
}
