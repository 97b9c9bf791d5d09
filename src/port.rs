//! Local TCP port probing.
//!
//! The prober answers one question: starting at a preferred port, which is the
//! first port nothing is listening on? A port counts as free only when it can
//! be bound on the wildcard and loopback addresses of both IPv4 and IPv6.
//! Hosts without IPv6 only check the IPv4 pair.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpListener;

/// Finds an available port, starting from `preferred`.
pub trait PortProber {
    fn probe(&self, preferred: u16) -> impl Future<Output = io::Result<u16>> + Send;
}

/// Probes by binding real sockets, walking upwards from the preferred port.
#[derive(Debug, Clone)]
pub struct TcpPortProber {
    timeout: Duration,
}

impl TcpPortProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn scan(preferred: u16) -> io::Result<u16> {
        for port in preferred..=u16::MAX {
            if port_is_free(port).await? {
                return Ok(port);
            }
            tracing::debug!(port, "port in use");
        }
        Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no available port in {}..={}", preferred, u16::MAX),
        ))
    }
}

impl Default for TcpPortProber {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl PortProber for TcpPortProber {
    fn probe(&self, preferred: u16) -> impl Future<Output = io::Result<u16>> + Send {
        let timeout = self.timeout;
        async move {
            match tokio::time::timeout(timeout, Self::scan(preferred)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("port probe timed out after {}ms", timeout.as_millis()),
                )),
            }
        }
    }
}

// Port 0 means "any" to the OS, so it is never reported as free.
async fn port_is_free(port: u16) -> io::Result<bool> {
    if port == 0 {
        return Ok(false);
    }
    let addrs: [IpAddr; 4] = [
        Ipv4Addr::UNSPECIFIED.into(),
        Ipv4Addr::LOCALHOST.into(),
        Ipv6Addr::UNSPECIFIED.into(),
        Ipv6Addr::LOCALHOST.into(),
    ];
    for ip in addrs {
        match TcpListener::bind(SocketAddr::new(ip, port)).await {
            Ok(listener) => drop(listener),
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => return Ok(false),
            Err(err) if ip.is_ipv6() && ipv6_unavailable(&err) => {
                tracing::trace!(%ip, %err, "skipping address");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

fn ipv6_unavailable(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::AddrNotAvailable | io::ErrorKind::Unsupported
    ) {
        return true;
    }
    #[cfg(unix)]
    {
        if err.raw_os_error() == Some(libc::EAFNOSUPPORT) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occupied_listener() -> (std::net::TcpListener, u16) {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn returns_preferred_port_when_free() {
        let (listener, port) = occupied_listener();
        drop(listener);
        let prober = TcpPortProber::default();
        assert_eq!(prober.probe(port).await.unwrap(), port);
    }

    #[tokio::test]
    async fn skips_occupied_port() {
        let (_listener, port) = occupied_listener();
        let prober = TcpPortProber::default();
        let found = prober.probe(port).await.unwrap();
        assert!(found > port);
    }

    #[tokio::test]
    async fn skips_port_held_on_ipv6_loopback() {
        // Hosts without IPv6 cannot hold the port this way.
        let Ok(listener) = std::net::TcpListener::bind(("::1", 0)) else {
            return;
        };
        let port = listener.local_addr().unwrap().port();
        let prober = TcpPortProber::default();
        let found = prober.probe(port).await.unwrap();
        assert_ne!(found, port);
    }

    #[test]
    fn missing_ipv6_support_is_not_an_error() {
        let err = io::Error::from(io::ErrorKind::AddrNotAvailable);
        assert!(ipv6_unavailable(&err));
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(!ipv6_unavailable(&err));
    }
}
