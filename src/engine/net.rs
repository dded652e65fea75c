// Address resolution and bounded TCP connects shared by both channels.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{AgentError, Result};

pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| {
            debug!("lookup of {} failed: {}", host, e);
            AgentError::Resolve {
                host: host.to_string(),
            }
        })?;
    addrs.next().ok_or_else(|| AgentError::Resolve {
        host: host.to_string(),
    })
}

/// Connect with a bounded timeout. Reads on the returned stream never time out.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Err(_) => Err(AgentError::ConnectTimeout {
            addr: addr.to_string(),
        }),
        Ok(Err(source)) => Err(AgentError::Connect {
            addr: addr.to_string(),
            source,
        }),
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("set_nodelay on {} failed: {}", addr, e);
            }
            Ok(stream)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = resolve("127.0.0.1", 11210).await.unwrap();
        assert_eq!(addr.port(), 11210);
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_connect_sets_nodelay() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = connect(addr, Duration::from_secs(2)).await.unwrap();
        assert!(stream.nodelay().unwrap());
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        match connect(addr, Duration::from_secs(2)).await {
            Err(e) => assert!(e.is_transient()),
            Ok(_) => panic!("connect to a closed port succeeded"),
        }
    }
}
