//! Userspace port forwarding.
//!
//! NAT rules only rewrite traffic that crosses the filter hooks; loopback
//! connections to a published port never do. Each mapping therefore also
//! runs a small userspace proxy bound to the host endpoint, which doubles
//! as the only forwarding path when the packet filter is disabled.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Notify;

use crate::error::{NetworkError, NetworkResult};
use crate::filter::Protocol;

/// A UDP "connection" with no traffic for this long is forgotten.
const UDP_SESSION_TIMEOUT: Duration = Duration::from_secs(90);

/// A running forwarder between one host endpoint and one backend.
#[async_trait]
pub trait Proxy: Send + Sync {
    /// Serve until [`Proxy::close`] is called.
    async fn run(&self);

    /// Stop serving. Idempotent; unblocks a pending [`Proxy::run`].
    fn close(&self);

    /// The host endpoint actually bound (resolves port 0 requests).
    fn frontend(&self) -> SocketAddr;
}

/// Creates proxies; binding happens here so address conflicts surface
/// before any mapping state is recorded.
#[async_trait]
pub trait ProxyFactory: Send + Sync {
    async fn new_proxy(
        &self,
        frontend: SocketAddr,
        backend: SocketAddr,
        proto: Protocol,
    ) -> NetworkResult<Arc<dyn Proxy>>;
}

/// Tokio-based [`ProxyFactory`] producing TCP and UDP forwarders.
#[derive(Debug, Default)]
pub struct TokioProxyFactory;

#[async_trait]
impl ProxyFactory for TokioProxyFactory {
    async fn new_proxy(
        &self,
        frontend: SocketAddr,
        backend: SocketAddr,
        proto: Protocol,
    ) -> NetworkResult<Arc<dyn Proxy>> {
        match proto {
            Protocol::Tcp => {
                let listener = TcpListener::bind(frontend)
                    .await
                    .map_err(|e| start_failure(frontend, e))?;
                Ok(Arc::new(TcpProxy {
                    frontend: listener
                        .local_addr()
                        .map_err(|e| start_failure(frontend, e))?,
                    listener,
                    backend,
                    shutdown: Notify::new(),
                    closed: AtomicBool::new(false),
                }))
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind(frontend)
                    .await
                    .map_err(|e| start_failure(frontend, e))?;
                Ok(Arc::new(UdpProxy {
                    frontend: socket
                        .local_addr()
                        .map_err(|e| start_failure(frontend, e))?,
                    socket: Arc::new(socket),
                    backend,
                    shutdown: Notify::new(),
                    closed: AtomicBool::new(false),
                    sessions: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
                }))
            }
        }
    }
}

struct TcpProxy {
    listener: TcpListener,
    frontend: SocketAddr,
    backend: SocketAddr,
    shutdown: Notify,
    closed: AtomicBool,
}

#[async_trait]
impl Proxy for TcpProxy {
    async fn run(&self) {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            tokio::select! {
                _ = self.shutdown.notified() => return,
                accepted = self.listener.accept() => match accepted {
                    Ok((client, peer)) => {
                        tracing::debug!("proxying tcp {peer} -> {}", self.backend);
                        let backend = self.backend;
                        tokio::spawn(async move {
                            if let Err(e) = forward_tcp(client, backend).await {
                                tracing::debug!("tcp proxy stream from {peer} ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("tcp proxy accept on {} failed: {e}", self.frontend);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_one();
    }

    fn frontend(&self) -> SocketAddr {
        self.frontend
    }
}

async fn forward_tcp(mut client: TcpStream, backend: SocketAddr) -> std::io::Result<()> {
    let mut upstream = TcpStream::connect(backend).await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

fn start_failure(frontend: SocketAddr, e: std::io::Error) -> NetworkError {
    NetworkError::ProxyStartFailure {
        addr: frontend.to_string(),
        reason: e.to_string(),
    }
}

struct UdpProxy {
    socket: Arc<UdpSocket>,
    frontend: SocketAddr,
    backend: SocketAddr,
    shutdown: Notify,
    closed: AtomicBool,
    /// One connected socket per client peer, expired after idle timeout.
    sessions: Arc<tokio::sync::Mutex<HashMap<SocketAddr, Arc<UdpSocket>>>>,
}

#[async_trait]
impl Proxy for UdpProxy {
    async fn run(&self) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            tokio::select! {
                _ = self.shutdown.notified() => return,
                received = self.socket.recv_from(&mut buf) => {
                    let (len, client) = match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("udp proxy recv on {} failed: {e}", self.frontend);
                            continue;
                        }
                    };
                    match self.session(client).await {
                        Ok(session) => {
                            if let Err(e) = session.send(&buf[..len]).await {
                                tracing::debug!("udp proxy send to {} failed: {e}", self.backend);
                            }
                        }
                        Err(e) => tracing::debug!("udp session for {client} failed: {e}"),
                    }
                },
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_one();
    }

    fn frontend(&self) -> SocketAddr {
        self.frontend
    }
}

impl UdpProxy {
    /// The backend-facing socket for `client`, creating it and its reply
    /// pump on first use.
    async fn session(&self, client: SocketAddr) -> std::io::Result<Arc<UdpSocket>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&client) {
            return Ok(existing.clone());
        }

        let bind_any = if self.backend.is_ipv4() {
            SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0)
        };
        let session = Arc::new(UdpSocket::bind(bind_any).await?);
        session.connect(self.backend).await?;
        sessions.insert(client, session.clone());

        let pump = session.clone();
        let front = self.socket.clone();
        let registry = self.sessions.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match tokio::time::timeout(UDP_SESSION_TIMEOUT, pump.recv(&mut buf)).await {
                    Ok(Ok(len)) => {
                        if front.send_to(&buf[..len], client).await.is_err() {
                            break;
                        }
                    }
                    // Idle or closed: the session is done either way.
                    _ => break,
                }
            }
            registry.lock().await.remove(&client);
        });

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn tcp_echo_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn tcp_proxy_forwards_both_directions() {
        let backend = tcp_echo_backend().await;
        let factory = TokioProxyFactory;
        let proxy = factory
            .new_proxy("127.0.0.1:0".parse().unwrap(), backend, Protocol::Tcp)
            .await
            .unwrap();
        let frontend = proxy.frontend();
        assert_ne!(frontend.port(), 0);

        let runner = proxy.clone();
        let task = tokio::spawn(async move { runner.run().await });

        let mut client = TcpStream::connect(frontend).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");

        proxy.close();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("proxy task must stop after close")
            .unwrap();
    }

    #[tokio::test]
    async fn udp_proxy_forwards_datagrams() {
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok((n, peer)) = backend.recv_from(&mut buf).await {
                let _ = backend.send_to(&buf[..n], peer).await;
            }
        });

        let factory = TokioProxyFactory;
        let proxy = factory
            .new_proxy("127.0.0.1:0".parse().unwrap(), backend_addr, Protocol::Udp)
            .await
            .unwrap();
        let frontend = proxy.frontend();

        let runner = proxy.clone();
        let task = tokio::spawn(async move { runner.run().await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"dns?", frontend).await.unwrap();
        let mut reply = [0u8; 4];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply[..n], b"dns?");

        proxy.close();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("proxy task must stop after close")
            .unwrap();
    }

    #[tokio::test]
    async fn bind_conflict_is_a_start_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let factory = TokioProxyFactory;
        let result = factory
            .new_proxy(addr, "127.0.0.1:9".parse().unwrap(), Protocol::Tcp)
            .await;
        assert!(matches!(
            result,
            Err(NetworkError::ProxyStartFailure { .. })
        ));
    }
}
