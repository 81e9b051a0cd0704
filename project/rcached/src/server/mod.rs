//! The cache-manager server: a single I/O task multiplexing the control
//! channel, the listening endpoint and all live client connections.

mod conn;
mod dispatch;
mod txn;

use crate::backend::CacheBackend;
use crate::endpoint::{CacheListener, CacheStream, Locator};
use anyhow::Context;
use common::{wire, Capabilities, Reply, DEFAULT_MAX_OBJECT_SIZE};
use futures::future::select_all;
use self::conn::ClientConnection;
use self::txn::{IdAllocator, TransactionTable};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Shared server-side state the dispatcher works on. Connections are kept
/// separately so a handler can borrow its connection and this state at the
/// same time.
pub(crate) struct ServerState {
    pub(crate) backend: Arc<dyn CacheBackend>,
    pub(crate) name: String,
    pub(crate) capabilities: Capabilities,
    pub(crate) max_object_size: usize,
    pub(crate) listing_budget: usize,
    pub(crate) ids: IdAllocator,
    pub(crate) txns: TransactionTable,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name advertised in the handshake ack.
    pub name: String,
    /// Upper bound on read sizes and per-part store payloads.
    pub max_object_size: usize,
    /// Approximate byte budget of one listing reply.
    pub listing_budget: usize,
    /// Worker count handed to the backend; the I/O path ignores it.
    pub num_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "rcached".to_string(),
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
            listing_budget: dispatch::DEFAULT_LISTING_BUDGET,
            num_workers: 0,
        }
    }
}

/// Out-of-band signals fed to the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Detach,
    Terminate,
}

/// Cloneable control-channel sender; safe to use from any task or signal
/// handler.
#[derive(Clone)]
pub struct ServerHandle {
    tx: UnboundedSender<ControlSignal>,
}

impl ServerHandle {
    /// Ask the server to notify every attached client that it is about to
    /// go away. Connections stay open.
    pub fn ask_to_detach(&self) {
        let _ = self.tx.send(ControlSignal::Detach);
    }

    /// Ask the server to leave its event loop and tear down.
    pub fn terminate(&self) {
        let _ = self.tx.send(ControlSignal::Terminate);
    }
}

enum Event {
    Control(Option<ControlSignal>),
    Incoming(io::Result<(CacheStream, String)>),
    Ready(usize),
}

/// The external cache-manager server.
pub struct CacheServer {
    state: ServerState,
    listener: CacheListener,
    connections: Vec<ClientConnection>,
    ctrl_tx: UnboundedSender<ControlSignal>,
    ctrl_rx: UnboundedReceiver<ControlSignal>,
}

impl CacheServer {
    /// Bind the endpoint and provision the backend. Fails fatally on an
    /// unbindable locator, as the server cannot start without it.
    pub async fn bind(
        config: ServerConfig,
        backend: Arc<dyn CacheBackend>,
        locator: &Locator,
    ) -> anyhow::Result<Self> {
        backend
            .start(config.num_workers)
            .await
            .map_err(|err| anyhow::anyhow!("backend start failed: {err}"))?;
        let listener = locator
            .bind()
            .await
            .with_context(|| format!("failed to create endpoint {locator}"))?;
        let capabilities = backend.capabilities();
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        Ok(Self {
            state: ServerState {
                backend,
                name: config.name,
                capabilities,
                max_object_size: config.max_object_size,
                listing_budget: config.listing_budget,
                ids: IdAllocator::new(),
                txns: TransactionTable::new(),
            },
            listener,
            connections: Vec::new(),
            ctrl_tx,
            ctrl_rx,
        })
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            tx: self.ctrl_tx.clone(),
        }
    }

    /// Local address of a TCP endpoint (`None` for unix sockets); useful
    /// with `tcp=<host>:0`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until a `Terminate` signal arrives. Control signals take
    /// priority over new connections, which take priority over requests;
    /// ready connections are served in insertion order.
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("cache manager {} ready", self.state.name);
        loop {
            let event = tokio::select! {
                biased;
                signal = self.ctrl_rx.recv() => Event::Control(signal),
                incoming = self.listener.accept() => Event::Incoming(incoming),
                index = next_ready(&self.connections), if !self.connections.is_empty() => {
                    Event::Ready(index)
                }
            };
            match event {
                Event::Control(Some(ControlSignal::Detach)) => self.broadcast_detach(),
                Event::Control(Some(ControlSignal::Terminate)) | Event::Control(None) => {
                    if !self.connections.is_empty() {
                        warn!(
                            "terminating cache manager with {} pending connections",
                            self.connections.len()
                        );
                    }
                    break;
                }
                Event::Incoming(Ok((stream, peer))) => {
                    debug!("established connection with {peer}");
                    self.connections.push(ClientConnection::new(stream, peer));
                }
                Event::Incoming(Err(err)) => {
                    warn!("failed to establish connection: {err}");
                }
                Event::Ready(index) => {
                    let proceed =
                        dispatch::handle_request(&mut self.state, &mut self.connections[index])
                            .await;
                    if !proceed {
                        let connection = self.connections.remove(index);
                        self.teardown_connection(connection).await;
                    }
                }
            }
        }

        for connection in std::mem::take(&mut self.connections) {
            self.teardown_connection(connection).await;
        }
        // Backstop: nothing should be left after per-connection reclamation.
        for (key, txn_id) in self.state.txns.drain_all() {
            warn!(
                "aborting stale transaction {txn_id} of session {}",
                key.session_id
            );
            if let Err(err) = self.state.backend.abort_txn(txn_id).await {
                warn!("failed to abort transaction {txn_id}: {err}");
            }
        }
        Ok(())
    }

    /// Tell every attached client to reconnect elsewhere. One-shot,
    /// non-blocking, failures ignored; no connection is closed.
    fn broadcast_detach(&self) {
        let buf = match wire::encode_frame(&Reply::Detach, &[]) {
            Ok(buf) => buf,
            Err(err) => {
                warn!("failed to encode detach message: {err}");
                return;
            }
        };
        debug!("asking {} attached clients to detach", self.connections.len());
        for connection in &self.connections {
            connection.try_send(&buf);
        }
    }

    /// Release everything a closed connection owned: in-flight transactions
    /// of its sessions and listing cursors it left open.
    async fn teardown_connection(&mut self, mut connection: ClientConnection) {
        for (key, txn_id) in self.state.txns.drain_sessions(connection.sessions()) {
            debug!(
                "aborting transaction {txn_id} left behind by session {}",
                key.session_id
            );
            if let Err(err) = self.state.backend.abort_txn(txn_id).await {
                warn!("failed to abort transaction {txn_id}: {err}");
            }
        }
        for listing_id in connection.take_listings() {
            if let Err(err) = self.state.backend.listing_end(listing_id).await {
                warn!("failed to close listing {listing_id}: {err}");
            }
        }
        debug!("closed connection with {}", connection.peer());
    }
}

/// Index of the first connection with pending input, polled in insertion
/// order. Readiness errors are deferred to the receive path, which tears
/// the connection down.
async fn next_ready(connections: &[ClientConnection]) -> usize {
    let readable = connections
        .iter()
        .map(|connection| Box::pin(connection.readable()));
    let (_, index, _) = select_all(readable).await;
    index
}
