//! Request/response transport over TCP
//!
//! Every exchange uses its own connection: the requester connects, writes a
//! single framed envelope, reads a single framed reply and closes. The
//! [`Transport`] trait abstracts the outbound half so the routing logic can be
//! exercised against the in-memory [`mock`] network in tests.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::EnvelopeCodec;
use crate::inflight::InflightRequests;
use crate::message::Message;
use crate::{Error, Result};

/// Outbound half of the protocol.
pub trait Transport: Send + Sync + 'static {
    /// Send `message` to `to` and wait for the correlated response.
    ///
    /// Fails with [`Error::Timeout`] once `timeout` has elapsed; the
    /// connection is released on every exit path.
    fn send(
        &self,
        to: SocketAddr,
        message: Message,
        timeout: Duration,
    ) -> impl Future<Output = Result<Message>> + Send;
}

/// Inbound half of the protocol: answers one request per connection.
pub trait RequestHandler: Send + Sync + 'static {
    /// Produce the response to `request`, or `None` to close without replying.
    fn handle(&self, request: Message, from: SocketAddr) -> Option<Message>;
}

/// TCP transport with per-request timeouts.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    id_bits: u16,
    inflight: InflightRequests,
}

impl TcpTransport {
    /// Create a transport decoding identifiers of `id_bits` width.
    pub fn new(id_bits: u16) -> Self {
        Self {
            id_bits,
            inflight: InflightRequests::new(),
        }
    }

    /// Requests currently awaiting a response.
    pub fn inflight(&self) -> &InflightRequests {
        &self.inflight
    }

    async fn exchange(&self, to: SocketAddr, request: Message) -> Result<Message> {
        let guard = self.inflight.register(to, request.kind());
        let request_id = guard.request_id();

        let stream = TcpStream::connect(to)
            .await
            .map_err(|e| Error::ConnectionFailure(format!("connect to {to}: {e}")))?;
        let mut framed = Framed::new(stream, EnvelopeCodec::new());

        framed
            .send(request.clone().into_envelope(request_id))
            .await
            .map_err(|e| classify(e, to))?;

        let envelope = match framed.next().await {
            Some(Ok(envelope)) => envelope,
            Some(Err(e)) => return Err(classify(e, to)),
            None => {
                return Err(Error::ConnectionFailure(format!(
                    "{to} closed the connection without responding"
                )))
            }
        };

        if envelope.request_id != request_id {
            return Err(Error::ProtocolViolation(format!(
                "{to} answered request {request_id} with id {}",
                envelope.request_id
            )));
        }

        let payload = envelope
            .payload
            .ok_or_else(|| Error::ProtocolViolation(format!("empty response from {to}")))?;
        let response = Message::from_payload(payload, self.id_bits)
            .map_err(|e| Error::ProtocolViolation(format!("bad response from {to}: {e}")))?;

        if !request.is_answered_by(&response) {
            return Err(Error::ProtocolViolation(format!(
                "{to} answered {} with {}",
                request.kind(),
                response.kind()
            )));
        }

        if let Some(pending) = guard.complete() {
            debug!(
                "{} to {} answered in {:?}",
                pending.kind,
                to,
                pending.sent_at.elapsed()
            );
        }

        Ok(response)
    }
}

impl Transport for TcpTransport {
    fn send(
        &self,
        to: SocketAddr,
        message: Message,
        timeout: Duration,
    ) -> impl Future<Output = Result<Message>> + Send {
        async move {
            match tokio::time::timeout(timeout, self.exchange(to, message)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            }
        }
    }
}

// Socket errors mean the peer is unreachable; anything else came from a
// connection that worked but carried bytes we can't accept.
fn classify(e: Error, peer: SocketAddr) -> Error {
    match e {
        Error::Io(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            Error::ProtocolViolation(format!("{peer}: {e}"))
        }
        Error::Io(e) => Error::ConnectionFailure(format!("{peer}: {e}")),
        e @ (Error::ProtocolViolation(_) | Error::ConnectionFailure(_) | Error::Timeout) => e,
        other => Error::ProtocolViolation(format!("{peer}: {other}")),
    }
}

/// Settings for the inbound accept loop.
#[derive(Debug, Clone, Copy)]
pub struct ServeConfig {
    /// Width of identifiers carried in requests.
    pub id_bits: u16,
    /// How long a connection may take to deliver its request and accept the
    /// reply before it is dropped.
    pub read_timeout: Duration,
}

/// Accept connections until `shutdown` fires, answering one request per
/// connection.
///
/// Malformed or unexpected messages are dropped without a reply; nothing a
/// remote peer sends stops the loop.
pub async fn serve<H: RequestHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    config: ServeConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Accepting connections on {}", addr);
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Accept loop shutting down");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, handler, config).await {
                            debug!("Dropped connection from {}: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    // Usually descriptor exhaustion; back off instead of spinning.
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_connection<H: RequestHandler>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    config: ServeConfig,
) -> Result<()> {
    let mut framed = Framed::new(stream, EnvelopeCodec::new());

    let envelope = match tokio::time::timeout(config.read_timeout, framed.next()).await {
        Err(_) => return Err(Error::Timeout),
        Ok(None) => {
            return Err(Error::ConnectionFailure(
                "closed before sending a request".to_string(),
            ))
        }
        Ok(Some(Err(e))) => return Err(classify(e, peer)),
        Ok(Some(Ok(envelope))) => envelope,
    };

    let request_id = envelope.request_id;
    let payload = envelope
        .payload
        .ok_or_else(|| Error::ProtocolViolation("empty request".to_string()))?;
    let request = Message::from_payload(payload, config.id_bits)
        .map_err(|e| Error::ProtocolViolation(e.to_string()))?;

    if request.is_response() {
        return Err(Error::ProtocolViolation(format!(
            "unsolicited {}",
            request.kind()
        )));
    }

    debug!("Received {} from {}", request.kind(), peer);

    let Some(response) = handler.handle(request, peer) else {
        return Ok(());
    };

    match tokio::time::timeout(
        config.read_timeout,
        framed.send(response.into_envelope(request_id)),
    )
    .await
    {
        Ok(result) => result.map_err(|e| classify(e, peer)),
        Err(_) => Err(Error::Timeout),
    }
}

pub mod mock {
    //! In-memory network for testing routing logic without sockets

    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    /// A set of simulated nodes addressed by socket address.
    #[derive(Clone, Default)]
    pub struct MockNetwork {
        nodes: Arc<Mutex<HashMap<SocketAddr, Arc<dyn RequestHandler>>>>,
        silent: Arc<Mutex<HashSet<SocketAddr>>>,
        sent: Arc<Mutex<Vec<(SocketAddr, Message)>>>,
    }

    impl MockNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        /// Attach a handler answering requests sent to `addr`.
        pub fn register(&self, addr: SocketAddr, handler: Arc<dyn RequestHandler>) {
            self.nodes.lock().insert(addr, handler);
        }

        /// Detach the node at `addr`; later sends fail to connect.
        pub fn unregister(&self, addr: SocketAddr) {
            self.nodes.lock().remove(&addr);
        }

        /// Make `addr` accept requests but never answer them.
        pub fn set_silent(&self, addr: SocketAddr) {
            self.silent.lock().insert(addr);
        }

        /// A transport sending from `local`.
        pub fn transport(&self, local: SocketAddr) -> MockTransport {
            MockTransport {
                network: self.clone(),
                local,
            }
        }

        /// Every message sent so far with its destination.
        pub fn sent(&self) -> Vec<(SocketAddr, Message)> {
            self.sent.lock().clone()
        }

        /// Number of messages sent to `addr`.
        pub fn sent_to(&self, addr: SocketAddr) -> usize {
            self.sent.lock().iter().filter(|(to, _)| *to == addr).count()
        }
    }

    /// Transport delivering requests through a [`MockNetwork`].
    #[derive(Clone)]
    pub struct MockTransport {
        network: MockNetwork,
        local: SocketAddr,
    }

    impl Transport for MockTransport {
        fn send(
            &self,
            to: SocketAddr,
            message: Message,
            timeout: Duration,
        ) -> impl Future<Output = Result<Message>> + Send {
            async move {
                self.network.sent.lock().push((to, message.clone()));

                let silent = self.network.silent.lock().contains(&to);
                if silent {
                    tokio::time::sleep(timeout).await;
                    return Err(Error::Timeout);
                }

                let handler = self.network.nodes.lock().get(&to).cloned();
                let Some(handler) = handler else {
                    return Err(Error::ConnectionFailure(format!(
                        "connect to {to}: connection refused"
                    )));
                };

                // Yield so concurrent requests interleave like real I/O.
                tokio::task::yield_now().await;

                match handler.handle(message.clone(), self.local) {
                    Some(response) if message.is_answered_by(&response) => Ok(response),
                    Some(response) => Err(Error::ProtocolViolation(format!(
                        "{to} answered {} with {}",
                        message.kind(),
                        response.kind()
                    ))),
                    None => Err(Error::ConnectionFailure(format!(
                        "{to} closed the connection without responding"
                    ))),
                }
            }
        }
    }

}
