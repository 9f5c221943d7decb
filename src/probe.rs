//! Readiness probes used by `Service::operational` implementations.
//!
//! Probes never error: anything other than a positive answer is `false`.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// True if a TCP connection to `host:port` succeeds.
pub async fn tcp_connect(host: &str, port: u16) -> bool {
    match timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            trace!(host, port, error = %e, "tcp probe failed");
            false
        }
        Err(_) => false,
    }
}

/// Connect, optionally send `send`, and check that the reply contains
/// `expect`.
pub async fn tcp_banner(host: &str, port: u16, send: Option<&str>, expect: &str) -> bool {
    let exchange = async {
        let mut stream = TcpStream::connect((host, port)).await?;
        if let Some(payload) = send {
            stream.write_all(payload.as_bytes()).await?;
        }
        let mut buf = vec![0u8; 4096];
        let mut received = Vec::new();
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
            if String::from_utf8_lossy(&received).contains(expect) {
                break;
            }
        }
        Ok::<_, std::io::Error>(String::from_utf8_lossy(&received).into_owned())
    };

    match timeout(PROBE_TIMEOUT, exchange).await {
        Ok(Ok(reply)) => reply.contains(expect),
        Ok(Err(e)) => {
            trace!(host, port, error = %e, "banner probe failed");
            false
        }
        Err(_) => false,
    }
}

/// HEAD `url`; any response below 500 counts.
pub async fn http_head(url: &str) -> bool {
    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            trace!(url, error = %e, "http client build failed");
            return false;
        }
    };
    match client.head(url).send().await {
        Ok(resp) => !resp.status().is_server_error(),
        Err(e) => {
            trace!(url, error = %e, "http probe failed");
            false
        }
    }
}
