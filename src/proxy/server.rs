//! Proxy server implementation using hyper
//!
//! Accepts client connections on the fleet's entry point and hands each
//! request to the [`ProxyHandler`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{FleetError, Result};
use crate::proxy::handler::{error_response, ProxyHandler};
use crate::proxy::middleware::ProxyAuth;

/// Resolves once `rx` carries `true`; never resolves if the sender is gone
pub(crate) async fn signalled(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|fired| *fired).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Proxy server
pub struct ProxyServer {
    listener: TcpListener,
    handler: Arc<ProxyHandler>,
    auth: ProxyAuth,
}

impl ProxyServer {
    /// Bind the listening socket
    pub async fn bind(addr: &str, handler: Arc<ProxyHandler>, auth: ProxyAuth) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handler,
            auth,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop until `shutdown` fires
    ///
    /// Connections already accepted keep being served until the handler's
    /// abort signal fires.
    #[instrument(skip(self, shutdown))]
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = self.local_addr()?;
        info!("Proxy server listening on {}", addr);

        let stop = signalled(shutdown);
        tokio::pin!(stop);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = self.handler.clone();
                            let auth = self.auth.clone();

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    client_addr,
                                    handler,
                                    auth,
                                ).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = &mut stop => {
                    info!("Proxy server no longer accepting connections");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle a single connection
    async fn handle_connection(
        stream: TcpStream,
        client_addr: SocketAddr,
        handler: Arc<ProxyHandler>,
        auth: ProxyAuth,
    ) -> Result<()> {
        let io = TokioIo::new(stream);
        let abort = handler.abort_signal();

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            let auth = auth.clone();

            async move {
                if auth.validate(&req).is_err() {
                    return Ok::<_, Infallible>(auth.challenge_response());
                }

                match handler.handle(req, client_addr).await {
                    Ok(response) => Ok(response),
                    Err(e) => {
                        match &e {
                            FleetError::InvalidRequest(_) => debug!("Rejected request: {}", e),
                            e if e.is_server_error() => warn!("Request failed: {}", e),
                            _ => debug!("Request failed: {}", e),
                        }
                        Ok(error_response(&e))
                    }
                }
            }
        });

        let conn = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades();

        tokio::select! {
            result = conn => {
                result.map_err(|e| FleetError::Http(e.to_string()))?;
            }
            _ = signalled(abort) => {
                debug!(client = %client_addr, "Client connection closed by shutdown");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::config::ProxyAuthConfig;
    use crate::models::{Backend, InstanceKey};
    use crate::pool::RoutingTable;
    use crate::proxy::handler::ProxyHandlerConfig;
    use crate::proxy::rotation::{ConnectionTracker, RoundRobinPolicy};

    /// Minimal forward proxy: answers plain requests with `<tag>|<request line>`
    /// and echoes bytes after a successful CONNECT
    async fn spawn_backend(tag: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let head = read_head(&mut socket).await;
                    let request_line = head.lines().next().unwrap_or_default().to_string();
                    if request_line.starts_with("CONNECT ") {
                        socket
                            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                            .await
                            .unwrap();
                        let (mut r, mut w) = socket.split();
                        let _ = tokio::io::copy(&mut r, &mut w).await;
                    } else {
                        let body = format!("{}|{}", tag, request_line);
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        socket.write_all(response.as_bytes()).await.unwrap();
                    }
                });
            }
        });
        addr
    }

    async fn dead_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    async fn read_head(socket: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if socket.read(&mut byte).await.unwrap() == 0 {
                break;
            }
            head.push(byte[0]);
        }
        String::from_utf8_lossy(&head).to_string()
    }

    struct Harness {
        addr: SocketAddr,
        routing: Arc<RoutingTable>,
        tracker: Arc<ConnectionTracker>,
        _abort: watch::Sender<bool>,
        _shutdown: watch::Sender<bool>,
    }

    async fn start(backends: Vec<String>, auth: ProxyAuth) -> Harness {
        let routing = Arc::new(RoutingTable::new());
        routing.publish(
            backends
                .into_iter()
                .map(|a| Backend::new(InstanceKey::new(), a))
                .collect(),
        );
        let tracker = Arc::new(ConnectionTracker::new());
        let (abort_tx, abort_rx) = watch::channel(false);
        let handler = Arc::new(ProxyHandler::new(
            routing.clone(),
            Arc::new(RoundRobinPolicy::new()),
            tracker.clone(),
            ProxyHandlerConfig {
                connect_timeout: Duration::from_secs(2),
                request_timeout: Duration::from_secs(5),
            },
            abort_rx,
        ));
        let server = ProxyServer::bind("127.0.0.1:0", handler, auth).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(server.run(shutdown_rx));
        Harness {
            addr,
            routing,
            tracker,
            _abort: abort_tx,
            _shutdown: shutdown_tx,
        }
    }

    async fn send_raw(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
            .await
            .expect("proxy response timed out")
            .unwrap();
        String::from_utf8_lossy(&out).to_string()
    }

    const GET: &str =
        "GET http://target.test/path?q=1 HTTP/1.1\r\nHost: target.test\r\nConnection: close\r\n\r\n";

    #[tokio::test]
    async fn test_forwards_absolute_uri_request() {
        let backend = spawn_backend("alpha").await;
        let harness = start(vec![backend], ProxyAuth::disabled()).await;

        let response = send_raw(harness.addr, GET).await;
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(response.ends_with("alpha|GET http://target.test/path?q=1 HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_empty_table_fails_fast() {
        let harness = start(Vec::new(), ProxyAuth::disabled()).await;

        let started = Instant::now();
        let response = send_raw(harness.addr, GET).await;
        assert!(response.starts_with("HTTP/1.1 503"), "{}", response);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_retries_once_on_alternate_backend() {
        let dead = dead_address().await;
        let live = spawn_backend("beta").await;
        let harness = start(vec![dead, live], ProxyAuth::disabled()).await;

        // Round-robin starts at the dead backend; the retry lands on the live one.
        let response = send_raw(harness.addr, GET).await;
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(response.contains("beta|GET"));
    }

    #[tokio::test]
    async fn test_all_backends_failing_is_bad_gateway() {
        let harness = start(
            vec![dead_address().await, dead_address().await, dead_address().await],
            ProxyAuth::disabled(),
        )
        .await;

        let response = send_raw(harness.addr, GET).await;
        assert!(response.starts_with("HTTP/1.1 502"), "{}", response);
    }

    #[tokio::test]
    async fn test_relative_uri_rejected() {
        let backend = spawn_backend("alpha").await;
        let harness = start(vec![backend], ProxyAuth::disabled()).await;

        let response = send_raw(
            harness.addr,
            "GET /path HTTP/1.1\r\nHost: target.test\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 400"), "{}", response);
    }

    #[tokio::test]
    async fn test_connect_tunnel_passes_bytes_unchanged() {
        let backend = spawn_backend("alpha").await;
        let harness = start(vec![backend], ProxyAuth::disabled()).await;

        let mut stream = TcpStream::connect(harness.addr).await.unwrap();
        stream
            .write_all(b"CONNECT target.test:443 HTTP/1.1\r\nHost: target.test:443\r\n\r\n")
            .await
            .unwrap();
        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

        let payload: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
        stream.write_all(&payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
            .await
            .expect("tunnel echo timed out")
            .unwrap();
        assert_eq!(echoed, payload);
        assert_eq!(harness.tracker.total(), 1);

        drop(stream);
        for _ in 0..50 {
            if harness.tracker.total() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(harness.tracker.total(), 0);
    }

    #[tokio::test]
    async fn test_table_change_applies_to_new_connections() {
        let first = spawn_backend("first").await;
        let second = spawn_backend("second").await;
        let harness = start(vec![first], ProxyAuth::disabled()).await;

        assert!(send_raw(harness.addr, GET).await.contains("first|"));

        harness
            .routing
            .publish(vec![Backend::new(InstanceKey::new(), second)]);
        assert!(send_raw(harness.addr, GET).await.contains("second|"));
    }

    #[tokio::test]
    async fn test_auth_required() {
        let backend = spawn_backend("alpha").await;
        let auth = ProxyAuth::from_config(Some(&ProxyAuthConfig {
            username: "user".to_string(),
            password: "pass".to_string(),
        }));
        let harness = start(vec![backend], auth).await;

        let response = send_raw(harness.addr, GET).await;
        assert!(response.starts_with("HTTP/1.1 407"), "{}", response);
        assert!(response.contains("Proxy-Authenticate: Basic realm=\"proxyfleet\""));

        let credentials = BASE64.encode(b"user:pass");
        let request = format!(
            "GET http://target.test/ HTTP/1.1\r\nHost: target.test\r\nProxy-Authorization: Basic {}\r\nConnection: close\r\n\r\n",
            credentials
        );
        let response = send_raw(harness.addr, &request).await;
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    }
}
