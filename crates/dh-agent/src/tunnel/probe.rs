//! TCP reachability checks

use std::time::Duration;

use tokio::net::TcpStream;

/// Block until something accepts connections on the local `port`
pub async fn wait_until_listening(port: u16, poll: Duration) {
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            tracing::debug!("Port {} is accepting connections", port);
            return;
        }
        tokio::time::sleep(poll).await;
    }
}

/// Whether `host:port` accepts a TCP connection within `timeout`
pub async fn is_publicly_reachable(host: &str, port: u16, timeout: Duration) -> bool {
    if host.is_empty() {
        return false;
    }
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}
