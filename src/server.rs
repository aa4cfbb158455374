//! Local HTTP proxy listener and the handle owning one running bridge.
//!
//! # Lifecycle
//!
//! ```text
//! start(descriptor)
//!       |
//!       v
//! parse rule --> bind 127.0.0.1:<50000..60000> --> ProxyServerHandle
//!       |                                              |
//!       v                                              |
//! accept loop                                          |
//!   +-- CONNECT host:port --> SOCKS connect --> relay  |
//!   +-- GET http://...    --> pool acquire  --> forward|
//!                                                      v
//!                             close(): destroy sockets, clear pool,
//!                                      wait for drain, close listener
//! ```

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::pool::{ConnectionPool, PooledBody};
use crate::rule::ProxyRule;
use crate::socks::{DestinationKey, SocksConnector};
use crate::tunnel::{relay, ActiveSockets, SocketGuard};
use bytes::Bytes;
use http::header::{HeaderValue, CONNECTION, HOST, PROXY_AUTHORIZATION};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use rand::Rng;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

const BAD_GATEWAY_LINE: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// State shared by the accept loop and every client connection.
struct BridgeState {
    connector: Arc<SocksConnector>,
    sockets: Arc<ActiveSockets>,
    pool: Arc<ConnectionPool>,
    tunnel_idle_timeout: Option<Duration>,
}

/// One running bridge instance.
///
/// Each handle owns its own pool and socket set; separate instances share
/// nothing. Dropping the handle without calling [`close`](Self::close)
/// still cancels the listener and every socket, but does not wait for them.
pub struct ProxyServerHandle {
    url: String,
    local_addr: SocketAddr,
    state: Arc<BridgeState>,
    listener_token: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl ProxyServerHandle {
    /// `http://<ip>:<port>` of the local listener.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Upstream sockets currently open, pooled or tunneled.
    pub fn active_sockets(&self) -> usize {
        self.state.sockets.len()
    }

    /// Idle upstream connections waiting in the pool.
    pub fn pooled_sockets(&self) -> usize {
        self.state.pool.len()
    }

    /// Upstream connections the pool has opened since start.
    pub fn pool_connects(&self) -> u64 {
        self.state.pool.opened()
    }

    /// Tear the bridge down: destroy every upstream socket, clear the pool,
    /// then close the listener. Resolves once all of it is released.
    pub async fn close(mut self) -> Result<()> {
        let Some(accept_task) = self.accept_task.take() else {
            return Ok(());
        };
        info!(url = %self.url, "closing SOCKS bridge");

        self.state.sockets.shutdown();
        self.state.pool.clear();
        self.state.sockets.drained().await;

        self.listener_token.cancel();
        if let Err(e) = accept_task.await {
            if !e.is_cancelled() {
                warn!("listener task failed: {}", e);
            }
        }

        info!(url = %self.url, "SOCKS bridge closed");
        Ok(())
    }
}

impl Drop for ProxyServerHandle {
    fn drop(&mut self) {
        if self.accept_task.take().is_some() {
            self.state.sockets.shutdown();
            self.state.pool.clear();
            self.listener_token.cancel();
        }
    }
}

/// Start a bridge for `descriptor` with default settings.
pub async fn start(descriptor: &str) -> Result<ProxyServerHandle> {
    start_with_config(descriptor, BridgeConfig::default()).await
}

/// Start a bridge for `descriptor`.
///
/// Fails with [`BridgeError::InvalidRuleFormat`] before anything is bound
/// when the descriptor is malformed.
pub async fn start_with_config(descriptor: &str, config: BridgeConfig) -> Result<ProxyServerHandle> {
    let rule = ProxyRule::parse(descriptor)?;

    let listener = bind_ephemeral(&config).await?;
    let local_addr = listener.local_addr().map_err(|source| BridgeError::Listener {
        addr: SocketAddr::new(config.listen_ip, 0),
        source,
    })?;
    let url = format!("http://{}", local_addr);

    info!(%url, upstream = %rule, "SOCKS bridge listening");

    let connector = Arc::new(SocksConnector::new(rule));
    let sockets = Arc::new(ActiveSockets::new());
    let pool = Arc::new(ConnectionPool::new(
        connector.clone(),
        sockets.clone(),
        config.pool_idle_timeout,
    ));
    let state = Arc::new(BridgeState {
        connector,
        sockets,
        pool,
        tunnel_idle_timeout: config.tunnel_idle_timeout,
    });

    let listener_token = CancellationToken::new();
    let accept_task = tokio::spawn(accept_loop(
        listener,
        Arc::clone(&state),
        listener_token.clone(),
    ));

    Ok(ProxyServerHandle {
        url,
        local_addr,
        state,
        listener_token,
        accept_task: Some(accept_task),
    })
}

/// Bind a random port from the configured range, retrying ports in use.
async fn bind_ephemeral(config: &BridgeConfig) -> Result<TcpListener> {
    let range = config.port_range.clone();
    let no_free_port = || BridgeError::NoFreePort {
        start: range.start,
        end: range.end,
        attempts: config.bind_attempts,
    };
    if range.is_empty() {
        return Err(no_free_port());
    }

    for _ in 0..config.bind_attempts {
        let port = rand::thread_rng().gen_range(range.clone());
        let addr = SocketAddr::new(config.listen_ip, port);
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                debug!(%addr, "port in use, trying another");
            }
            Err(source) => return Err(BridgeError::Listener { addr, source }),
        }
    }
    Err(no_free_port())
}

async fn accept_loop(listener: TcpListener, state: Arc<BridgeState>, token: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = token.cancelled() => break,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept error: {} (continuing)", e);
                    continue;
                }
            },
        };
        debug!(%peer, "accepted client connection");
        tokio::spawn(serve_client(stream, peer, Arc::clone(&state)));
    }

    drop(listener);
    debug!("listener closed");
}

async fn serve_client(stream: TcpStream, peer: SocketAddr, state: Arc<BridgeState>) {
    let shutdown = state.sockets.shutdown_signal();
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| proxy(req, Arc::clone(&state)));

    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades();

    tokio::select! {
        res = conn => {
            if let Err(err) = res {
                // Dropped requests surface as user errors; not worth a warning.
                if err.is_user() || err.is_incomplete_message() {
                    debug!(%peer, "client connection ended: {}", err);
                } else {
                    warn!(%peer, "client connection error: {:?}", err);
                }
            }
        }
        _ = shutdown.cancelled() => {
            debug!(%peer, "client connection cancelled by shutdown");
        }
    }
}

async fn proxy(req: Request<Incoming>, state: Arc<BridgeState>) -> Result<Response<ProxyBody>> {
    if Method::CONNECT == req.method() {
        connect_tunnel(req, state).await
    } else {
        forward(req, state).await
    }
}

/// Plain forward request: reuse or open a pooled upstream connection and
/// stream the response back.
async fn forward(mut req: Request<Incoming>, state: Arc<BridgeState>) -> Result<Response<ProxyBody>> {
    let Some(target) = DestinationKey::from_uri(req.uri(), 80) else {
        debug!("dropping request without target host: {:?}", req.uri());
        return Err(BridgeError::MissingHost);
    };
    prepare_forward_request(&mut req, &target);

    let mut conn = match state.pool.acquire(&target).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("{}", e);
            return Ok(status_response(StatusCode::BAD_GATEWAY, e.to_string()));
        }
    };

    let resp = match conn.send_request(req).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(%target, id = conn.id(), "upstream request failed: {}", e);
            return Ok(status_response(
                StatusCode::BAD_GATEWAY,
                BridgeError::Http(e).to_string(),
            ));
        }
    };

    let pool = Arc::clone(&state.pool);
    Ok(resp.map(|body| PooledBody::new(body, pool, conn).boxed_unsync()))
}

/// Rewrite an absolute-form proxy request into what the origin expects.
fn prepare_forward_request(req: &mut Request<Incoming>, target: &DestinationKey) {
    let origin_form = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse::<Uri>()
        .ok();
    if let Some(uri) = origin_form {
        *req.uri_mut() = uri;
    }

    let headers = req.headers_mut();
    headers.remove("proxy-connection");
    headers.remove(PROXY_AUTHORIZATION);
    if !headers.contains_key(HOST) {
        if let Ok(value) = HeaderValue::from_str(&target.host_header(80)) {
            headers.insert(HOST, value);
        }
    }
}

/// `CONNECT` request: open an exclusive upstream socket, answer
/// `200 Connection Established` and relay the upgraded connection.
async fn connect_tunnel(req: Request<Incoming>, state: Arc<BridgeState>) -> Result<Response<ProxyBody>> {
    let Some(target) = DestinationKey::from_authority(req.uri()) else {
        warn!("CONNECT target is not host:port: {:?}", req.uri());
        return Ok(closing(status_response(
            StatusCode::BAD_REQUEST,
            "CONNECT must be to host:port",
        )));
    };

    let upstream = match state.connector.connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("{}", e);
            let mut resp = Response::new(empty());
            *resp.status_mut() = StatusCode::BAD_GATEWAY;
            return Ok(closing(resp));
        }
    };
    let guard = state.sockets.register();
    let idle_timeout = state.tunnel_idle_timeout;

    tokio::spawn(async move {
        let upgraded = tokio::select! {
            res = hyper::upgrade::on(req) => res,
            _ = guard.token().cancelled() => return,
        };
        match upgraded {
            Ok(upgraded) => tunnel(upgraded, upstream, guard, target, idle_timeout).await,
            Err(e) => warn!(%target, "upgrade error: {}", e),
        }
    });

    let mut resp = Response::new(empty());
    resp.extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    Ok(resp)
}

/// Relay one tunnel until it ends. Any socket error is fatal to the tunnel:
/// a best-effort `502` goes to the client, then both sides are closed.
async fn tunnel(
    upgraded: Upgraded,
    mut upstream: TcpStream,
    guard: SocketGuard,
    target: DestinationKey,
    idle_timeout: Option<Duration>,
) {
    let mut client = TokioIo::new(upgraded);

    match relay(&mut client, &mut upstream, guard.token(), idle_timeout).await {
        Ok(stats) => debug!(
            %target,
            from_client = stats.from_client,
            from_upstream = stats.from_upstream,
            "tunnel closed"
        ),
        Err(e) => {
            warn!(%target, "tunnel error: {}", e);
            let _ = client.write_all(BAD_GATEWAY_LINE).await;
        }
    }

    // On shutdown the sockets are simply dropped.
    if !guard.token().is_cancelled() {
        let _ = upstream.shutdown().await;
        let _ = client.shutdown().await;
    }
    drop(upstream);
    drop(client);
    drop(guard);
}

fn status_response<T: Into<Bytes>>(status: StatusCode, body: T) -> Response<ProxyBody> {
    let mut resp = Response::new(full(body));
    *resp.status_mut() = status;
    resp
}

fn closing(mut resp: Response<ProxyBody>) -> Response<ProxyBody> {
    resp.headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    resp
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}
