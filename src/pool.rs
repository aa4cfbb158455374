//! Reuse of upstream HTTP/1.1 connections for plain (non-`CONNECT`) requests.
//!
//! A SOCKS handshake costs an extra round trip, so a connection opened for a
//! [`DestinationKey`] is kept after its exchange and handed to the next
//! request for the same key. A connection is out of the pool for the whole
//! time an exchange runs on it and only returns once the response body has
//! ended, so two exchanges never share a socket at the same time.

use crate::error::Result;
use crate::socks::{DestinationKey, SocksConnector};
use crate::tunnel::{ActiveSockets, SocketGuard};
use bytes::Bytes;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::client::conn::http1::{self, SendRequest};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type UpstreamIo = TokioIo<ActivityStream<TcpStream>>;

/// Idle upstream connections keyed by destination.
#[derive(Debug)]
pub struct ConnectionPool {
    connector: Arc<SocksConnector>,
    sockets: Arc<ActiveSockets>,
    idle: Mutex<HashMap<DestinationKey, PooledConnection>>,
    idle_timeout: Duration,
    opened: AtomicU64,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<SocksConnector>,
        sockets: Arc<ActiveSockets>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            sockets,
            idle: Mutex::new(HashMap::new()),
            idle_timeout,
            opened: AtomicU64::new(0),
        }
    }

    /// Get a connection for `key`: a live pooled one if present, otherwise a
    /// fresh one through the upstream proxy.
    pub async fn acquire(self: &Arc<Self>, key: &DestinationKey) -> Result<PooledConnection> {
        if let Some(mut conn) = self.take_idle(key) {
            // The previous exchange may still be settling inside the client
            // connection; wait for it to accept a new request.
            if conn.sender.ready().await.is_ok() {
                debug!(%key, id = conn.id, "reusing pooled upstream connection");
                return Ok(conn);
            }
            debug!(%key, id = conn.id, "pooled upstream connection closed, evicting");
        }
        self.open(key).await
    }

    /// Put `conn` back under its key once its exchange has finished.
    ///
    /// A destroyed connection is dropped instead. A connection already idle
    /// under the same key is replaced and destroyed.
    pub fn release(&self, conn: PooledConnection) {
        let displaced = {
            let mut idle = self.lock();
            // Checked under the lock: the driver purges by id under the same
            // lock after the token fires, so a cancelled entry never lingers.
            if conn.token.is_cancelled() || conn.sender.is_closed() {
                return;
            }
            debug!(key = %conn.key, id = conn.id, "returning upstream connection to pool");
            idle.insert(conn.key.clone(), conn)
        };
        if let Some(old) = displaced {
            debug!(key = %old.key, id = old.id, "replacing idle upstream connection");
        }
    }

    /// Destroy every idle connection.
    pub fn clear(&self) {
        let drained: Vec<_> = self.lock().drain().map(|(_, conn)| conn).collect();
        if !drained.is_empty() {
            debug!("cleared {} pooled upstream connections", drained.len());
        }
    }

    /// Number of idle connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Total upstream connections this pool has opened.
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    fn take_idle(&self, key: &DestinationKey) -> Option<PooledConnection> {
        let conn = self.lock().remove(key)?;
        if conn.sender.is_closed() || conn.token.is_cancelled() {
            debug!(%key, id = conn.id, "evicting destroyed pooled connection");
            return None;
        }
        Some(conn)
    }

    async fn open(self: &Arc<Self>, key: &DestinationKey) -> Result<PooledConnection> {
        let stream = self.connector.connect(key).await?;
        let guard = self.sockets.register();

        let activity = Activity::new();
        let io = TokioIo::new(ActivityStream::new(stream, activity.clone()));
        let (sender, conn) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(io)
            .await?;

        let id = guard.id();
        let token = guard.token().clone();
        self.opened.fetch_add(1, Ordering::Relaxed);
        debug!(%key, id, "opened upstream connection");

        tokio::spawn(drive(
            Arc::downgrade(self),
            key.clone(),
            conn,
            guard,
            activity,
            self.idle_timeout,
        ));

        Ok(PooledConnection {
            key: key.clone(),
            id,
            sender,
            token,
        })
    }

    /// Remove the entry for `key` if it is still connection `id`.
    fn purge(&self, key: &DestinationKey, id: u64) {
        let removed = {
            let mut idle = self.lock();
            match idle.get(key) {
                Some(conn) if conn.id == id => idle.remove(key),
                _ => None,
            }
        };
        if removed.is_some() {
            debug!(%key, id, "purged upstream connection from pool");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DestinationKey, PooledConnection>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Keeps one upstream HTTP connection running until it closes, is destroyed
/// or sees no traffic for `idle_timeout`, then takes it out of the pool and
/// the active set.
async fn drive(
    pool: Weak<ConnectionPool>,
    key: DestinationKey,
    conn: http1::Connection<UpstreamIo, Incoming>,
    guard: SocketGuard,
    activity: Activity,
    idle_timeout: Duration,
) {
    let mut conn = Box::pin(conn);
    loop {
        let idle_for = activity.idle_for();
        if idle_for >= idle_timeout {
            debug!(%key, id = guard.id(), "upstream connection idle for {:?}, destroying", idle_for);
            break;
        }
        tokio::select! {
            res = &mut conn => {
                if let Err(err) = res {
                    if !err.is_incomplete_message() && !err.is_canceled() {
                        warn!(%key, id = guard.id(), "upstream connection error: {}", err);
                    }
                }
                break;
            }
            _ = guard.token().cancelled() => break,
            _ = tokio::time::sleep(idle_timeout - idle_for) => {}
        }
    }

    drop(conn);
    if let Some(pool) = pool.upgrade() {
        pool.purge(&key, guard.id());
    }
    drop(guard);
}

/// An upstream connection checked out of (or sitting in) the pool.
///
/// Dropping it destroys the socket; only [`ConnectionPool::release`] keeps
/// it alive.
#[derive(Debug)]
pub struct PooledConnection {
    key: DestinationKey,
    id: u64,
    sender: SendRequest<Incoming>,
    token: CancellationToken,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send one request on this connection.
    pub async fn send_request(
        &mut self,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<Incoming>, hyper::Error> {
        self.sender.send_request(req).await
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Response body that hands its connection back to the pool once the last
/// frame has been read. Dropped early or failed, the connection is destroyed.
pub struct PooledBody {
    inner: Incoming,
    checkin: Option<(Arc<ConnectionPool>, PooledConnection)>,
}

impl PooledBody {
    pub fn new(inner: Incoming, pool: Arc<ConnectionPool>, conn: PooledConnection) -> Self {
        let mut body = Self {
            inner,
            checkin: Some((pool, conn)),
        };
        // Bodiless responses (HEAD, 204, 304) are complete with the head.
        if body.inner.is_end_stream() {
            body.finish();
        }
        body
    }

    fn finish(&mut self) {
        if let Some((pool, conn)) = self.checkin.take() {
            pool.release(conn);
        }
    }
}

impl Body for PooledBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(None) => this.finish(),
            Poll::Ready(Some(Ok(_))) if this.inner.is_end_stream() => this.finish(),
            Poll::Ready(Some(Err(_))) => this.checkin = None,
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Last time bytes moved on a socket.
#[derive(Clone, Debug)]
struct Activity {
    epoch: Instant,
    last_millis: Arc<AtomicU64>,
}

impl Activity {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_millis.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

/// Stream wrapper recording read/write activity.
#[derive(Debug)]
pub struct ActivityStream<S> {
    inner: S,
    activity: Activity,
}

impl<S> ActivityStream<S> {
    fn new(inner: S, activity: Activity) -> Self {
        Self { inner, activity }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ActivityStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(polled, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.activity.touch();
        }
        polled
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ActivityStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_write(cx, buf);
        if matches!(polled, Poll::Ready(Ok(n)) if n > 0) {
            this.activity.touch();
        }
        polled
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        if matches!(polled, Poll::Ready(Ok(n)) if n > 0) {
            this.activity.touch();
        }
        polled
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
