//! A running node: accept loop plus bootstrap/refresh.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use kadnet_core::{serve, NodeId, PeerRecord, TcpTransport};
use kadnet_dht::{Bootstrap, Dht};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;

pub struct Node {
    dht: Dht<TcpTransport>,
    listen_addr: SocketAddr,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bind the listener and start serving and bootstrapping.
    ///
    /// Fails only on invalid configuration, when the listener cannot be bound
    /// or when no identifier can be generated.
    pub async fn start(config: &Config, shutdown: CancellationToken) -> anyhow::Result<Self> {
        config.validate()?;
        let dht_config = config.dht_config();

        let bind_addr = config.bind_addr()?;
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind {bind_addr}"))?;
        let listen_addr = listener.local_addr()?;

        let id = NodeId::random(dht_config.id_bits).context("Failed to generate node id")?;
        let local = PeerRecord::new(id, SocketAddr::new(config.public_ip()?, listen_addr.port()));
        let transport = TcpTransport::new(dht_config.id_bits);
        let dht = Dht::new(local, dht_config, transport)?;

        info!("Node {} listening on {}", local, listen_addr);

        let seeds = config.resolve_seeds().await;

        let serve_task = {
            let handler = Arc::new(dht.clone());
            let serve_config = config.serve_config();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = serve(listener, handler, serve_config, shutdown).await {
                    error!("Accept loop failed: {}", e);
                }
            })
        };
        let bootstrap_task = tokio::spawn(Bootstrap::new(dht.clone(), seeds).run(shutdown.clone()));

        Ok(Self {
            dht,
            listen_addr,
            shutdown,
            tasks: vec![serve_task, bootstrap_task],
        })
    }

    pub fn dht(&self) -> &Dht<TcpTransport> {
        &self.dht
    }

    pub fn local(&self) -> PeerRecord {
        self.dht.local()
    }

    /// The address the listener is bound to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Requests this node has sent that are still awaiting a response.
    pub fn inflight_count(&self) -> usize {
        self.dht.transport().inflight().len()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for the node's tasks to finish after shutdown.
    pub async fn wait(self) -> anyhow::Result<()> {
        for task in self.tasks {
            task.await.context("Node task panicked")?;
        }
        info!("Node {} stopped", self.dht.local());
        Ok(())
    }
}

/// Send a single NODE_INFO_REQUEST to `address` and return the responder.
///
/// The remote admits the sender into its routing table, so the client
/// advertises an ephemeral listener that answers for the duration of the
/// ping. Once it closes, the remote drops the record after failed contacts.
pub async fn ping(config: &Config, address: SocketAddr) -> anyhow::Result<PeerRecord> {
    config.validate()?;
    let dht_config = config.dht_config();

    let bind_addr = SocketAddr::new(config.bind_addr()?.ip(), 0);
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    let port = listener.local_addr()?.port();

    let id = NodeId::random(dht_config.id_bits).context("Failed to generate node id")?;
    let local = PeerRecord::new(id, SocketAddr::new(config.public_ip()?, port));
    let dht = Dht::new(local, dht_config, TcpTransport::new(config.dht.id_bits))?;

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve(
        listener,
        Arc::new(dht.clone()),
        config.serve_config(),
        shutdown.clone(),
    ));

    let result = dht.ping(address).await;

    shutdown.cancel();
    match server.await {
        Ok(Err(e)) => debug!("Ping listener failed: {}", e),
        Err(e) => debug!("Ping listener panicked: {}", e),
        Ok(Ok(())) => {}
    }

    let peer = result.with_context(|| format!("Ping to {address} failed"))?;
    Ok(peer)
}
