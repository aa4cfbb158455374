//! Tracking of live upstream sockets and the full-duplex relay.
//!
//! Every socket opened through the upstream proxy, pooled or tunneled, is
//! registered in [`ActiveSockets`] and holds a [`SocketGuard`] for as long as
//! it stays open. Shutdown cancels every guard's token; the tasks owning the
//! sockets observe the cancellation, drop their sockets and release their
//! guards, after which [`ActiveSockets::drained`] resolves.

use crate::error::{BridgeError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const RELAY_BUF_SIZE: usize = 16_384;

/// Set of every upstream socket currently open.
#[derive(Debug, Default)]
pub struct ActiveSockets {
    root: CancellationToken,
    members: Mutex<HashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
    drained: Notify,
}

impl ActiveSockets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly opened socket to the set.
    ///
    /// After [`shutdown`](Self::shutdown) the returned guard is already
    /// cancelled, so late sockets are torn down immediately.
    pub fn register(self: &Arc<Self>) -> SocketGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.root.child_token();
        self.lock().insert(id, token.clone());
        SocketGuard {
            id,
            token,
            sockets: Arc::clone(self),
        }
    }

    /// Destroy every member. Each member's token is cancelled exactly once.
    pub fn shutdown(&self) {
        self.root.cancel();
        let members = self.lock();
        debug!("destroying {} active upstream sockets", members.len());
        for token in members.values() {
            token.cancel();
        }
    }

    /// A token cancelled together with the whole set.
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Resolves once no socket is registered.
    pub async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn release(&self, id: u64) {
        let mut members = self.lock();
        members.remove(&id);
        if members.is_empty() {
            self.drained.notify_waiters();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, CancellationToken>> {
        // Recover from poisoning; the map itself is always consistent.
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Membership of one socket in [`ActiveSockets`].
///
/// Dropping the guard removes the socket from the set, so it must live
/// exactly as long as the socket does.
#[derive(Debug)]
pub struct SocketGuard {
    id: u64,
    token: CancellationToken,
    sockets: Arc<ActiveSockets>,
}

impl SocketGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancelled when the socket must be destroyed.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        self.token.cancel();
        self.sockets.release(self.id);
    }
}

/// Bytes moved by one relay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub from_client: u64,
    pub from_upstream: u64,
}

/// Copy bytes both ways between `client` and `upstream`, in order and
/// unmodified.
///
/// Each direction runs on its own: when one side reaches EOF the write half
/// of the other side is shut down and the opposite direction keeps flowing
/// until its source closes too. The relay also ends when `cancel` fires or
/// no byte has moved for `idle_timeout`; in that case, and on error, the
/// streams are left as they are and teardown belongs to the caller.
pub async fn relay<C, U>(
    client: &mut C,
    upstream: &mut U,
    cancel: &CancellationToken,
    idle_timeout: Option<Duration>,
) -> Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buf = vec![0u8; RELAY_BUF_SIZE];
    let mut upstream_buf = vec![0u8; RELAY_BUF_SIZE];
    let mut stats = RelayStats::default();
    let mut client_open = true;
    let mut upstream_open = true;

    let idle = tokio::time::sleep(idle_timeout.unwrap_or_default());
    tokio::pin!(idle);

    while client_open || upstream_open {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("relay cancelled");
                break;
            }
            res = client.read(&mut client_buf), if client_open => {
                match res {
                    Ok(0) => {
                        client_open = false;
                        upstream.shutdown().await.map_err(BridgeError::UpstreamSocket)?;
                    }
                    Ok(n) => {
                        upstream
                            .write_all(&client_buf[..n])
                            .await
                            .map_err(BridgeError::UpstreamSocket)?;
                        stats.from_client += n as u64;
                    }
                    Err(e) => return Err(BridgeError::ClientSocket(e)),
                }
            }
            res = upstream.read(&mut upstream_buf), if upstream_open => {
                match res {
                    Ok(0) => {
                        upstream_open = false;
                        client.shutdown().await.map_err(BridgeError::ClientSocket)?;
                    }
                    Ok(n) => {
                        client
                            .write_all(&upstream_buf[..n])
                            .await
                            .map_err(BridgeError::ClientSocket)?;
                        stats.from_upstream += n as u64;
                    }
                    Err(e) => return Err(BridgeError::UpstreamSocket(e)),
                }
            }
            _ = &mut idle, if idle_timeout.is_some() => {
                debug!("relay idle for {:?}, closing", idle_timeout);
                break;
            }
        }

        if let Some(timeout) = idle_timeout {
            idle.as_mut().reset(tokio::time::Instant::now() + timeout);
        }
    }

    Ok(stats)
}
