//! RPC protocol multiplexer.
//!
//! One listener per shard serves several logical services over the same
//! socket, selected by a protocol-level service tag. Each registration
//! carries its own scheduling domain and admission group so that, for
//! example, heavy replication traffic cannot starve cluster-metadata RPCs
//! sharing the same core.
//!
//! # Framing
//!
//! Request:  `u32 BE length | u8 service tag | u8 method | payload`
//! Response: `u32 BE length | u8 status code | payload`
//!
//! The status byte is the wire form of [`Errc`]; the payload encoding belongs
//! to each service.

pub mod builtin;
#[cfg(feature = "tls")]
pub mod tls;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::{Errc, NodeError, NodeResult};
use crate::node::domains::{DomainHandle, SmpGroup};

#[cfg(feature = "tls")]
use self::tls::ReloadableTls;

/// Service tags multiplexed on the internal cluster listener.
pub const RAFT_SERVICE_TAG: u8 = 0;
pub const CLUSTER_SERVICE_TAG: u8 = 1;
pub const ID_ALLOCATOR_SERVICE_TAG: u8 = 2;
pub const METADATA_SERVICE_TAG: u8 = 3;

/// Service tag for the client-facing protocol listener.
pub const KAFKA_API_SERVICE_TAG: u8 = 16;

/// Frames larger than this are rejected without reading the payload.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// A logical service attached to a listener under one tag.
#[async_trait]
pub trait RpcService: Send + Sync {
    fn name(&self) -> &'static str;

    /// Handle one request frame. The returned bytes are the response
    /// payload; an error becomes the response status code.
    async fn handle(&self, method: u8, body: Bytes) -> Result<Bytes, Errc>;
}

/// One (tag, domain, admission budget, handler) registration.
#[derive(Clone)]
pub struct ServiceRegistration {
    pub tag: u8,
    pub domain: DomainHandle,
    pub smp: SmpGroup,
    pub handler: Arc<dyn RpcService>,
}

type Registrations = Arc<RwLock<HashMap<u8, ServiceRegistration>>>;

/// Everything a live connection needs from its listener.
#[derive(Clone)]
struct ListenerContext {
    name: Arc<str>,
    registrations: Registrations,
    #[cfg(feature = "tls")]
    tls: Option<Arc<ReloadableTls>>,
}

/// A multiplexing RPC listener for one shard.
///
/// Constructed without binding; `start` binds the socket and begins
/// accepting. Registrations are made between construction and start; a
/// duplicate tag is a registration error and fatal to start-up.
pub struct RpcServer {
    name: Arc<str>,
    addr: SocketAddr,
    registrations: Registrations,
    #[cfg(feature = "tls")]
    tls: Option<Arc<ReloadableTls>>,
    shutdown_tx: broadcast::Sender<()>,
    bound: RwLock<Option<SocketAddr>>,
}

impl RpcServer {
    pub fn new(name: impl Into<String>, addr: &str) -> NodeResult<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| NodeError::Config(format!("Invalid listener address: {}", addr)))?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            name: Arc::from(name.into()),
            addr,
            registrations: Arc::new(RwLock::new(HashMap::new())),
            #[cfg(feature = "tls")]
            tls: None,
            shutdown_tx,
            bound: RwLock::new(None),
        })
    }

    /// Attach reloadable TLS credentials to this listener.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, tls: Arc<ReloadableTls>) -> Self {
        self.tls = Some(tls);
        self
    }

    #[cfg(feature = "tls")]
    pub fn tls(&self) -> Option<&Arc<ReloadableTls>> {
        self.tls.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a handler under a service tag.
    ///
    /// Fails if the tag is already registered on this listener; the first
    /// handler is never silently overwritten.
    pub fn register(
        &self,
        tag: u8,
        domain: DomainHandle,
        smp: SmpGroup,
        handler: Arc<dyn RpcService>,
    ) -> NodeResult<()> {
        let mut registrations = self.registrations.write().unwrap();
        if registrations.contains_key(&tag) {
            return Err(NodeError::DuplicateServiceTag {
                listener: self.name.to_string(),
                tag,
            });
        }
        debug!(
            listener = %self.name,
            tag,
            service = handler.name(),
            domain = domain.name(),
            "Service registered"
        );
        registrations.insert(
            tag,
            ServiceRegistration {
                tag,
                domain,
                smp,
                handler,
            },
        );
        Ok(())
    }

    pub fn registered_tags(&self) -> Vec<u8> {
        let mut tags: Vec<u8> = self.registrations.read().unwrap().keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    /// The bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.read().unwrap()
    }

    /// Bind the socket and begin accepting connections.
    pub async fn start(&self) -> NodeResult<SocketAddr> {
        let listener = TcpListener::bind(self.addr).await?;
        let local = listener.local_addr()?;
        *self.bound.write().unwrap() = Some(local);
        info!(listener = %self.name, addr = %local, "RPC server listening");

        let context = ListenerContext {
            name: self.name.clone(),
            registrations: self.registrations.clone(),
            #[cfg(feature = "tls")]
            tls: self.tls.clone(),
        };
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(accept_loop(context, listener, shutdown_rx));
        Ok(local)
    }

    /// Route one decoded frame to its registered service.
    ///
    /// An admission permit for the registration's group is held for the
    /// duration of the handler call, so a flooded service backpressures its
    /// own tag without affecting the other services on this listener.
    pub async fn dispatch_frame(&self, tag: u8, method: u8, body: Bytes) -> (u8, Bytes) {
        dispatch_registered(&self.registrations, tag, method, body).await
    }

    /// Stop accepting new connections. Existing connections finish their
    /// in-flight frames.
    pub fn shutdown(&self) -> Result<(), NodeError> {
        let _ = self.shutdown_tx.send(());
        Ok(())
    }
}

async fn accept_loop(
    context: ListenerContext,
    listener: TcpListener,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!(listener = %context.name, "RPC server shutting down, no longer accepting connections");
                return;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(listener = %context.name, error = %e, "Accept failed");
                        continue;
                    }
                };
                debug!(listener = %context.name, peer = %peer, "Accepted connection");
                tokio::spawn(handle_connection(context.clone(), stream, peer));
            }
        }
    }
}

async fn handle_connection(
    context: ListenerContext,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
) {
    #[cfg(feature = "tls")]
    if let Some(tls) = &context.tls {
        let acceptor = tls.acceptor();
        match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                if let Err(e) = serve_stream(&context, tls_stream).await {
                    debug!(listener = %context.name, peer = %peer, error = %e, "Connection closed");
                }
            }
            Err(e) => {
                warn!(listener = %context.name, peer = %peer, error = %e, "TLS handshake failed");
            }
        }
        return;
    }

    if let Err(e) = serve_stream(&context, stream).await {
        debug!(listener = %context.name, peer = %peer, error = %e, "Connection closed");
    }
}

async fn serve_stream<S>(context: &ListenerContext, mut stream: S) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let len = u32::from_be_bytes(len_buf);
        if len < 2 || len > MAX_FRAME_BYTES {
            error!(listener = %context.name, len, "Malformed frame length");
            return Ok(());
        }

        let mut frame = BytesMut::zeroed(len as usize);
        stream.read_exact(&mut frame).await?;
        let tag = frame[0];
        let method = frame[1];
        let body = frame.freeze().slice(2..);

        let (status, payload) = dispatch_registered(&context.registrations, tag, method, body).await;
        let reply_len = (payload.len() as u32) + 1;
        stream.write_all(&reply_len.to_be_bytes()).await?;
        stream.write_all(&[status]).await?;
        stream.write_all(&payload).await?;
        stream.flush().await?;
    }
}

async fn dispatch_registered(
    registrations: &Registrations,
    tag: u8,
    method: u8,
    body: Bytes,
) -> (u8, Bytes) {
    let registration = {
        let registrations = registrations.read().unwrap();
        registrations.get(&tag).cloned()
    };
    let Some(registration) = registration else {
        return (Errc::NotFound.code(), Bytes::new());
    };

    let _permit = match registration.smp.acquire().await {
        Ok(permit) => permit,
        Err(code) => return (code.code(), Bytes::new()),
    };

    match registration.handler.handle(method, body).await {
        Ok(payload) => (Errc::Success.code(), payload),
        Err(code) => (code.code(), Bytes::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomainBudgets;
    use crate::node::domains::{CLUSTER_DOMAIN, RAFT_DOMAIN, SchedulingGroups, SmpServiceGroups};

    struct EchoService;

    #[async_trait]
    impl RpcService for EchoService {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn handle(&self, method: u8, body: Bytes) -> Result<Bytes, Errc> {
            if method == 0 {
                Ok(body)
            } else {
                Err(Errc::InvalidArgument)
            }
        }
    }

    fn make_server() -> (Arc<RpcServer>, SchedulingGroups, SmpServiceGroups) {
        let scheduling = SchedulingGroups::create(
            &SchedulingGroups::default_specs(&DomainBudgets::default()),
            1,
        )
        .unwrap();
        let smp = SmpServiceGroups::create(&DomainBudgets::default()).unwrap();
        let server = Arc::new(RpcServer::new("test_rpc", "127.0.0.1:0").unwrap());
        (server, scheduling, smp)
    }

    #[test]
    fn test_new_rejects_invalid_addr() {
        assert!(RpcServer::new("bad", "nope").is_err());
    }

    #[test]
    fn test_duplicate_tag_rejected_first_handler_preserved() {
        let (server, scheduling, smp) = make_server();
        let domain = scheduling.group(RAFT_DOMAIN).unwrap();

        server
            .register(RAFT_SERVICE_TAG, domain.clone(), smp.raft(), Arc::new(EchoService))
            .unwrap();

        let err = server
            .register(RAFT_SERVICE_TAG, domain, smp.raft(), Arc::new(EchoService))
            .unwrap_err();
        match err {
            NodeError::DuplicateServiceTag { listener, tag } => {
                assert_eq!(listener, "test_rpc");
                assert_eq!(tag, RAFT_SERVICE_TAG);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(server.registered_tags(), vec![RAFT_SERVICE_TAG]);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_tag_is_not_found() {
        let (server, _scheduling, _smp) = make_server();
        let (status, payload) = server.dispatch_frame(42, 0, Bytes::new()).await;
        assert_eq!(Errc::from_code(status), Some(Errc::NotFound));
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_tag() {
        let (server, scheduling, smp) = make_server();
        server
            .register(
                CLUSTER_SERVICE_TAG,
                scheduling.group(CLUSTER_DOMAIN).unwrap(),
                smp.cluster(),
                Arc::new(EchoService),
            )
            .unwrap();

        let (status, payload) = server
            .dispatch_frame(CLUSTER_SERVICE_TAG, 0, Bytes::from_static(b"ping"))
            .await;
        assert_eq!(Errc::from_code(status), Some(Errc::Success));
        assert_eq!(payload, Bytes::from_static(b"ping"));

        let (status, _) = server
            .dispatch_frame(CLUSTER_SERVICE_TAG, 9, Bytes::new())
            .await;
        assert_eq!(Errc::from_code(status), Some(Errc::InvalidArgument));
    }

    #[tokio::test]
    async fn test_start_binds_and_serves_frames() {
        let (server, scheduling, smp) = make_server();
        server
            .register(
                RAFT_SERVICE_TAG,
                scheduling.group(RAFT_DOMAIN).unwrap(),
                smp.raft(),
                Arc::new(EchoService),
            )
            .unwrap();

        let addr = server.start().await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        // frame: len | tag | method | body
        let body = b"hello";
        let len = (body.len() as u32) + 2;
        client.write_all(&len.to_be_bytes()).await.unwrap();
        client.write_all(&[RAFT_SERVICE_TAG, 0]).await.unwrap();
        client.write_all(body).await.unwrap();

        let mut reply_len = [0u8; 4];
        client.read_exact(&mut reply_len).await.unwrap();
        let reply_len = u32::from_be_bytes(reply_len);
        assert_eq!(reply_len, (body.len() as u32) + 1);

        let mut reply = vec![0u8; reply_len as usize];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(Errc::from_code(reply[0]), Some(Errc::Success));
        assert_eq!(&reply[1..], body);

        server.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_admission_budget_isolates_tags() {
        // Exhaust one tag's budget and verify another tag still dispatches.
        let budgets = DomainBudgets {
            raft_inflight: 1,
            ..DomainBudgets::default()
        };
        let scheduling =
            SchedulingGroups::create(&SchedulingGroups::default_specs(&budgets), 1).unwrap();
        let smp = SmpServiceGroups::create(&budgets).unwrap();
        let server = Arc::new(RpcServer::new("test_rpc", "127.0.0.1:0").unwrap());

        server
            .register(
                RAFT_SERVICE_TAG,
                scheduling.group(RAFT_DOMAIN).unwrap(),
                smp.raft(),
                Arc::new(EchoService),
            )
            .unwrap();
        server
            .register(
                CLUSTER_SERVICE_TAG,
                scheduling.group(CLUSTER_DOMAIN).unwrap(),
                smp.cluster(),
                Arc::new(EchoService),
            )
            .unwrap();

        // Hold the raft group's only permit.
        let held = smp.raft().acquire().await.unwrap();

        let blocked = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .dispatch_frame(RAFT_SERVICE_TAG, 0, Bytes::from_static(b"x"))
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        // The cluster tag is unaffected.
        let (status, _) = server
            .dispatch_frame(CLUSTER_SERVICE_TAG, 0, Bytes::from_static(b"y"))
            .await;
        assert_eq!(Errc::from_code(status), Some(Errc::Success));

        drop(held);
        let (status, _) = blocked.await.unwrap();
        assert_eq!(Errc::from_code(status), Some(Errc::Success));
    }
}
