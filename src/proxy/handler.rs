//! Client request handling
//!
//! Picks a backend from the current routing table, connects to it (retrying
//! once against a different backend) and relays the request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, CONNECTION, CONTENT_TYPE};
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::config::ProxyServerConfig;
use crate::error::{FleetError, Result};
use crate::models::{Backend, InstanceKey};
use crate::pool::RoutingTable;
use crate::proxy::rotation::{ConnectionTracker, RotationPolicy, SelectionContext};
use crate::proxy::server::signalled;
use crate::proxy::transport::BackendTransport;
use crate::proxy::tunnel::{TunnelGuard, TunnelHandler};

/// Response body streamed back to clients
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// The first pick plus one retry against a different backend
const MAX_CONNECT_ATTEMPTS: u32 = 2;

/// Hop-by-hop headers never forwarded in either direction
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Configuration for proxy handler
#[derive(Debug, Clone)]
pub struct ProxyHandlerConfig {
    /// Timeout for establishing a backend connection (including CONNECT)
    pub connect_timeout: Duration,
    /// Timeout for the backend's response head
    pub request_timeout: Duration,
}

impl Default for ProxyHandlerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&ProxyServerConfig> for ProxyHandlerConfig {
    fn from(config: &ProxyServerConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
        }
    }
}

/// What the backend connection is for
enum Target {
    /// CONNECT tunnel to `host:port` through the backend
    Tunnel { host: String, port: u16 },
    /// Plain forwarding; the backend receives the absolute-URI request
    Forward,
}

/// Proxy request handler
pub struct ProxyHandler {
    routing: Arc<RoutingTable>,
    policy: Arc<dyn RotationPolicy>,
    tracker: Arc<ConnectionTracker>,
    config: ProxyHandlerConfig,
    abort: watch::Receiver<bool>,
}

impl ProxyHandler {
    pub fn new(
        routing: Arc<RoutingTable>,
        policy: Arc<dyn RotationPolicy>,
        tracker: Arc<ConnectionTracker>,
        config: ProxyHandlerConfig,
        abort: watch::Receiver<bool>,
    ) -> Self {
        Self {
            routing,
            policy,
            tracker,
            config,
            abort,
        }
    }

    /// Fires when open client connections must be torn down
    pub fn abort_signal(&self) -> watch::Receiver<bool> {
        self.abort.clone()
    }

    /// Handle an incoming proxy request
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        client: SocketAddr,
    ) -> Result<Response<ProxyBody>> {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req, client).await;
        }
        self.handle_http(req, client).await
    }

    /// Handle HTTP CONNECT request (HTTPS tunneling)
    async fn handle_connect(
        &self,
        req: Request<Incoming>,
        client: SocketAddr,
    ) -> Result<Response<ProxyBody>> {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| FleetError::InvalidRequest("CONNECT requires host:port".to_string()))?;
        let (host, port) = BackendTransport::parse_authority(&authority)?;

        let target = Target::Tunnel { host, port };
        let (backend, stream) = self.connect_backend(client, &target).await?;

        info!(backend = %backend, destination = %authority, "CONNECT tunnel established");

        let guard = TunnelGuard::new(backend.key, self.tracker.clone());
        let on_upgrade = hyper::upgrade::on(req);
        let abort = self.abort.clone();

        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    tokio::select! {
                        result = TunnelHandler::handle_upgraded(upgraded, stream, guard) => {
                            if let Err(e) = result {
                                debug!("Tunnel ended with error: {}", e);
                            }
                        }
                        _ = signalled(abort) => {
                            debug!("Tunnel closed by shutdown");
                        }
                    }
                }
                Err(e) => {
                    debug!("CONNECT upgrade failed: {}", e);
                }
            }
        });

        Ok(Response::new(empty_body()))
    }

    /// Handle a plain absolute-URI HTTP request
    async fn handle_http(
        &self,
        req: Request<Incoming>,
        client: SocketAddr,
    ) -> Result<Response<ProxyBody>> {
        if req.uri().scheme().is_none() || req.uri().host().is_none() {
            return Err(FleetError::InvalidRequest(
                "proxy requests need an absolute URI".to_string(),
            ));
        }
        let (target_host, target_port) = BackendTransport::parse_target(req.uri())?;

        let (backend, stream) = self.connect_backend(client, &Target::Forward).await?;
        debug!(
            backend = %backend,
            destination = %format!("{}:{}", target_host, target_port),
            "Forwarding request"
        );

        let guard = TunnelGuard::new(backend.key, self.tracker.clone());
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| FleetError::BackendConnectFailure(format!("handshake failed: {}", e)))?;

        // The guard lives as long as the backend connection, i.e. until the
        // response body has been fully relayed.
        let abort = self.abort.clone();
        tokio::spawn(async move {
            let _guard = guard;
            tokio::select! {
                result = conn => {
                    if let Err(e) = result {
                        debug!("Backend connection ended: {}", e);
                    }
                }
                _ = signalled(abort) => {
                    debug!("Backend connection closed by shutdown");
                }
            }
        });

        let (mut parts, body) = req.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        let request = Request::from_parts(parts, body);

        let response = tokio::time::timeout(self.config.request_timeout, sender.send_request(request))
            .await
            .map_err(|_| FleetError::Timeout)?
            .map_err(|e| FleetError::BackendConnectFailure(format!("request failed: {}", e)))?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Select a backend and connect to it, retrying once against a
    /// different backend when the first connection attempt fails
    async fn connect_backend(
        &self,
        client: SocketAddr,
        target: &Target,
    ) -> Result<(Backend, TcpStream)> {
        let snapshot = self.routing.load();
        if snapshot.is_empty() {
            return Err(FleetError::RoutingUnavailable);
        }

        let mut failed: Option<InstanceKey> = None;
        let mut attempts = 0;

        while attempts < MAX_CONNECT_ATTEMPTS {
            let mut ctx = SelectionContext::new(&self.tracker).client(client);
            if let Some(key) = failed.as_ref() {
                ctx = ctx.exclude(key);
            }
            let Some(backend) = self.policy.select(&snapshot.backends, &ctx) else {
                break;
            };
            attempts += 1;

            match self.open(&backend.address, target).await {
                Ok(stream) => return Ok((backend, stream)),
                Err(e) => {
                    warn!(
                        backend = %backend,
                        attempt = attempts,
                        error = %e,
                        "Backend connection failed"
                    );
                    failed = Some(backend.key);
                }
            }
        }

        if attempts == 0 {
            return Err(FleetError::RoutingUnavailable);
        }
        Err(FleetError::BackendsExhausted { attempts })
    }

    async fn open(&self, address: &str, target: &Target) -> Result<TcpStream> {
        match target {
            Target::Tunnel { host, port } => {
                BackendTransport::connect_tunnel(address, host, *port, self.config.connect_timeout)
                    .await
            }
            Target::Forward => BackendTransport::dial(address, self.config.connect_timeout).await,
        }
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub fn full_body(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Plain-text response for a request that could not be served
pub fn error_response(err: &FleetError) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(format!("{}\n", err)));
    *response.status_mut() = err.status_code();
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    response
}
