use crate::error::{BridgeError, Result};
use crate::rule::{ProxyRule, SocksVersion};
use http::Uri;
use std::fmt;
use std::io;
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::debug;

/// Far-end target of a proxied request, normalized to `host:port`.
///
/// Doubles as the connection pool key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DestinationKey {
    host: String,
    port: u16,
}

impl DestinationKey {
    /// Host names are lowercased and IPv6 brackets stripped.
    pub fn new(host: &str, port: u16) -> Self {
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        Self {
            host: host.to_ascii_lowercase(),
            port,
        }
    }

    /// Target of an absolute-form request URI, or `None` when it has no host.
    pub fn from_uri(uri: &Uri, default_port: u16) -> Option<Self> {
        let host = uri.host().filter(|h| !h.is_empty())?;
        Some(Self::new(host, uri.port_u16().unwrap_or(default_port)))
    }

    /// Target of an authority-form `CONNECT` request. Both host and an
    /// explicit port are required.
    pub fn from_authority(uri: &Uri) -> Option<Self> {
        let authority = uri.authority()?;
        let port = authority.port_u16()?;
        let host = authority.host();
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Value for a `Host` header, omitting the port when it is the default.
    pub fn host_header(&self, default_port: u16) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Opens raw sockets to destinations through the upstream SOCKS proxy.
///
/// Callers own the returned socket and must register it with
/// [`ActiveSockets`](crate::tunnel::ActiveSockets) before using it.
#[derive(Debug)]
pub struct SocksConnector {
    rule: ProxyRule,
}

impl SocksConnector {
    pub fn new(rule: ProxyRule) -> Self {
        Self { rule }
    }

    /// Perform the SOCKS `CONNECT` handshake for `target`.
    pub async fn connect(&self, target: &DestinationKey) -> Result<TcpStream> {
        match self.handshake(target).await {
            Ok(stream) => {
                debug!(%target, upstream = %self.rule.proxy_addr(), "SOCKS handshake complete");
                Ok(stream)
            }
            Err(source) => Err(BridgeError::UpstreamConnectFailed {
                target: target.to_string(),
                source,
            }),
        }
    }

    async fn handshake(
        &self,
        target: &DestinationKey,
    ) -> std::result::Result<TcpStream, tokio_socks::Error> {
        let port = u16::try_from(self.rule.port()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("proxy port {} is out of range", self.rule.port()),
            )
        })?;

        // Resolve per attempt so a proxy host that moves is picked up.
        let proxy = tokio::net::lookup_host((self.rule.host(), port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses resolved for {}", self.rule.proxy_addr()),
                )
            })?;

        let target_addr = (target.host(), target.port());
        let stream = match self.rule.version() {
            SocksVersion::V5 => Socks5Stream::connect_with_password(
                proxy,
                target_addr,
                self.rule.user_id(),
                self.rule.password(),
            )
            .await?
            .into_inner(),
            // SOCKS4 carries a user id only; the password has no field on the wire.
            SocksVersion::V4 => {
                Socks4Stream::connect_with_userid(proxy, target_addr, self.rule.user_id())
                    .await?
                    .into_inner()
            }
        };
        Ok(stream)
    }
}
