use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::codec::write_counted;
use super::UploadError;
use crate::config::CollectorConfig;

/// An open request towards the collector.
#[async_trait]
pub trait FrameUplink: Send {
    /// Writes `data` and returns how many bytes the transport accepted.
    async fn write(&mut self, data: &[u8]) -> Result<usize, UploadError>;

    async fn close(&mut self);
}

/// Opens requests towards the collector.
#[async_trait]
pub trait CollectorConnector: Send + Sync {
    /// Connects and sends the request head.
    async fn open(&self, head: &[u8]) -> Result<Box<dyn FrameUplink>, UploadError>;

    /// Value for the `Host:` header.
    fn host(&self) -> &str;
}

/// HTTP request body writer over any byte stream. Every write, the head
/// included, fails with [`UploadError::WriteTimeout`] once it stalls longer
/// than the configured limit.
pub struct HttpUplink<S> {
    stream: S,
    write_timeout: Duration,
}

impl<S> HttpUplink<S>
where
    S: AsyncWrite + Unpin + Send,
{
    pub async fn start(
        stream: S,
        head: &[u8],
        write_timeout: Duration,
    ) -> Result<Self, UploadError> {
        let mut uplink = Self {
            stream,
            write_timeout,
        };
        let written = uplink.send(head).await?;
        if written != head.len() {
            return Err(UploadError::ShortWrite {
                written,
                expected: head.len(),
            });
        }
        Ok(uplink)
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, UploadError> {
        let stream = &mut self.stream;
        let send = async {
            let written = write_counted(&mut *stream, data).await?;
            stream.flush().await?;
            Ok::<_, std::io::Error>(written)
        };
        match tokio::time::timeout(self.write_timeout, send).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(UploadError::WriteTimeout(self.write_timeout)),
        }
    }
}

#[async_trait]
impl<S> FrameUplink for HttpUplink<S>
where
    S: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, data: &[u8]) -> Result<usize, UploadError> {
        self.send(data).await
    }

    async fn close(&mut self) {
        match tokio::time::timeout(self.write_timeout, self.stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Uplink shutdown failed"),
            Err(_) => debug!("Uplink shutdown timed out"),
        }
    }
}

/// TCP connector for the collector endpoint
pub struct TcpCollector {
    host: String,
    endpoint: String,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl TcpCollector {
    pub fn new(config: &CollectorConfig) -> Self {
        Self {
            host: config.host.clone(),
            endpoint: config.endpoint(),
            connect_timeout: config.connect_timeout(),
            write_timeout: config.write_timeout(),
        }
    }
}

#[async_trait]
impl CollectorConnector for TcpCollector {
    async fn open(&self, head: &[u8]) -> Result<Box<dyn FrameUplink>, UploadError> {
        let connect = TcpStream::connect(&self.endpoint);
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| UploadError::ConnectTimeout(self.endpoint.clone()))??;
        stream.set_nodelay(true)?;
        debug!(endpoint = %self.endpoint, "Collector connection open");

        Ok(Box::new(HttpUplink::start(stream, head, self.write_timeout).await?))
    }

    fn host(&self) -> &str {
        &self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test(start_paused = true)]
    async fn test_stalled_reader_times_out_write() {
        // the far end never reads, so the pipe fills and writes park
        let (_collector, node) = tokio::io::duplex(64);
        let limit = Duration::from_secs(3);
        let mut uplink = HttpUplink::start(node, b"POST / HTTP/1.1\r\n\r\n", limit)
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        let result = uplink.write(&[0u8; 1024]).await;
        assert_matches!(result, Err(UploadError::WriteTimeout(d)) if d == limit);
        assert!(started.elapsed() >= limit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_head_times_out() {
        let (_collector, node) = tokio::io::duplex(8);
        let result = HttpUplink::start(node, &[b'x'; 64], Duration::from_secs(1)).await;
        assert_matches!(result.err(), Some(UploadError::WriteTimeout(_)));
    }

    #[tokio::test]
    async fn test_tcp_collector_sends_head_and_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            received
        });

        let config = CollectorConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        };
        let collector = TcpCollector::new(&config);
        assert_eq!(collector.host(), "127.0.0.1");

        let mut uplink = collector.open(b"HEAD\r\n\r\n").await.unwrap();
        assert_eq!(uplink.write(b"payload").await.unwrap(), 7);
        uplink.close().await;
        drop(uplink);

        assert_eq!(server.await.unwrap(), b"HEAD\r\n\r\npayload");
    }

    #[tokio::test]
    async fn test_tcp_collector_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = CollectorConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        };
        assert!(TcpCollector::new(&config).open(b"x").await.is_err());
    }
}
