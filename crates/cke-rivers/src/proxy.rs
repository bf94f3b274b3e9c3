use anyhow::{Context, Result};
use tokio::io;
use tokio::net::TcpStream;
use tracing::debug;

/// Splice `client` to a fresh connection to `upstream` until either side closes.
pub async fn proxy_connection(mut client: TcpStream, upstream: &str) -> Result<(u64, u64)> {
    let mut backend = TcpStream::connect(upstream)
        .await
        .with_context(|| format!("connect to upstream {upstream}"))?;
    let (up, down) = io::copy_bidirectional(&mut client, &mut backend)
        .await
        .with_context(|| format!("proxy to {upstream}"))?;
    debug!(upstream, up, down, "connection closed");
    Ok((up, down))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_proxy_echo() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut s, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = s.read(&mut buf).await.unwrap();
            s.write_all(&buf[..n]).await.unwrap();
        });

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        tokio::spawn(async move {
            let (s, _) = front.accept().await.unwrap();
            let _ = proxy_connection(s, &echo_addr).await;
        });

        let mut c = TcpStream::connect(front_addr).await.unwrap();
        c.write_all(b"hello apiserver").await.unwrap();
        let mut buf = vec![0u8; 15];
        c.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello apiserver");
    }

    #[tokio::test]
    async fn test_proxy_upstream_refused() {
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (s, _) = front.accept().await.unwrap();
            proxy_connection(s, "127.0.0.1:1").await
        });
        let _c = TcpStream::connect(front_addr).await.unwrap();
        let err = accept.await.unwrap().unwrap_err();
        assert!(format!("{err:#}").contains("127.0.0.1:1"));
    }
}
