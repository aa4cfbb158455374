//! In-process SOCKS5 proxy and HTTP origin used by the unit tests.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct SocksServer {
    pub addr: SocketAddr,
    connects: Arc<AtomicUsize>,
}

impl SocksServer {
    /// Number of successful `CONNECT` commands served so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

/// Minimal SOCKS5 server requiring username/password auth.
pub async fn spawn_socks5_server(user: &'static str, pass: &'static str) -> SocksServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connects = Arc::new(AtomicUsize::new(0));
    let counter = connects.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let counter = counter.clone();
            tokio::spawn(async move {
                let _ = serve_socks5(stream, user, pass, counter).await;
            });
        }
    });
    SocksServer { addr, connects }
}

async fn serve_socks5(
    mut client: TcpStream,
    user: &str,
    pass: &str,
    counter: Arc<AtomicUsize>,
) -> std::io::Result<()> {
    let Some((host, port)) = socks5_handshake(&mut client, user, pass).await? else {
        return Ok(());
    };

    let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(_) => {
            client
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            return Ok(());
        }
    };
    counter.fetch_add(1, Ordering::SeqCst);
    client
        .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
        .await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// SOCKS5 server that accepts every `CONNECT` without dialing the target,
/// then resets the connection as soon as the client sends anything.
pub async fn spawn_resetting_socks5_server(user: &'static str, pass: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let Ok(Some(_)) = socks5_handshake(&mut stream, user, pass).await else {
                    return;
                };
                if stream
                    .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
                    .await
                    .is_err()
                {
                    return;
                }
                let mut buf = [0u8; 1];
                let _ = stream.read(&mut buf).await;
                // Zero linger turns the close into a RST.
                #[allow(deprecated)]
                let _ = stream.set_linger(Some(Duration::ZERO));
                drop(stream);
            });
        }
    });
    addr
}

/// Method negotiation, user/pass auth and the `CONNECT` request. Returns the
/// requested target, or `None` once a refusal has been written.
async fn socks5_handshake(
    client: &mut TcpStream,
    user: &str,
    pass: &str,
) -> std::io::Result<Option<(String, u16)>> {
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    client.read_exact(&mut methods).await?;
    if !methods.contains(&0x02) {
        client.write_all(&[0x05, 0xff]).await?;
        return Ok(None);
    }
    client.write_all(&[0x05, 0x02]).await?;

    let mut ver_ulen = [0u8; 2];
    client.read_exact(&mut ver_ulen).await?;
    let mut uname = vec![0u8; ver_ulen[1] as usize];
    client.read_exact(&mut uname).await?;
    let mut plen = [0u8; 1];
    client.read_exact(&mut plen).await?;
    let mut passwd = vec![0u8; plen[0] as usize];
    client.read_exact(&mut passwd).await?;
    if uname != user.as_bytes() || passwd != pass.as_bytes() {
        client.write_all(&[0x01, 0x01]).await?;
        return Ok(None);
    }
    client.write_all(&[0x01, 0x00]).await?;

    let mut req = [0u8; 4];
    client.read_exact(&mut req).await?;
    let host = match req[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        0x04 => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip).await?;
            std::net::Ipv6Addr::from(ip).to_string()
        }
        _ => return Ok(None),
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;
    Ok(Some((host, u16::from_be_bytes(port))))
}

pub struct Socks4Server {
    pub addr: SocketAddr,
    user_ids: Arc<Mutex<Vec<String>>>,
}

impl Socks4Server {
    /// User ids presented in each `CONNECT` request, in arrival order.
    pub fn user_ids(&self) -> Vec<String> {
        self.user_ids.lock().unwrap().clone()
    }
}

/// Minimal SOCKS4/4a server. Any user id is accepted and recorded.
pub async fn spawn_socks4_server() -> Socks4Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let user_ids = Arc::new(Mutex::new(Vec::new()));
    let seen = user_ids.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let seen = seen.clone();
            tokio::spawn(async move {
                let _ = serve_socks4(stream, seen).await;
            });
        }
    });
    Socks4Server { addr, user_ids }
}

async fn serve_socks4(
    mut client: TcpStream,
    seen: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    // VN, CD, DSTPORT, DSTIP
    let mut req = [0u8; 8];
    client.read_exact(&mut req).await?;
    if req[0] != 0x04 || req[1] != 0x01 {
        return Ok(());
    }
    let port = u16::from_be_bytes([req[2], req[3]]);
    let ip = std::net::Ipv4Addr::new(req[4], req[5], req[6], req[7]);

    let user_id = read_nul_terminated(&mut client).await?;
    seen.lock().unwrap().push(user_id);

    // 0.0.0.x with x != 0 marks a SOCKS4a request carrying a host name.
    let octets = ip.octets();
    let host = if octets[..3] == [0, 0, 0] && octets[3] != 0 {
        read_nul_terminated(&mut client).await?
    } else {
        ip.to_string()
    };

    let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(_) => {
            client.write_all(&[0x00, 0x5b, 0, 0, 0, 0, 0, 0]).await?;
            return Ok(());
        }
    };
    client.write_all(&[0x00, 0x5a, 0, 0, 0, 0, 0, 0]).await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

async fn read_nul_terminated(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut out = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == 0 {
            break;
        }
        out.push(byte);
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

pub struct Origin {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

impl Origin {
    /// Number of TCP connections the origin has accepted.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// HTTP/1.1 keep-alive origin answering `path=<path>`, after `delay`.
pub async fn spawn_origin(delay: Duration) -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| async move {
                    tokio::time::sleep(delay).await;
                    let body = format!("path={}", req.uri());
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    Origin { addr, connections }
}

/// Plain TCP echo server.
pub async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// TCP server that reads until the client half-closes, then answers with
/// `reply` and closes.
pub async fn spawn_reply_after_eof(reply: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut request = Vec::new();
                if stream.read_to_end(&mut request).await.is_ok() {
                    let _ = stream.write_all(reply).await;
                }
            });
        }
    });
    addr
}

/// Issue one `GET` for `url` through the HTTP proxy at `proxy`, on a fresh
/// client connection. Returns the status and body.
pub async fn proxied_get(proxy: SocketAddr, url: &str) -> (u16, String) {
    let stream = TcpStream::connect(proxy).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = Request::get(url).body(Empty::<Bytes>::new()).unwrap();
    let resp = sender.send_request(req).await.unwrap();
    let status = resp.status().as_u16();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}

/// Read from `stream` until the end of an HTTP head.
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
