//! Transport abstraction (TCP, TLS over TCP, Unix socket)

use crate::{Error, Result};
use bytes::BytesMut;
use rustls::ClientConfig;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::client::TlsStream;

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Byte stream to the server
pub enum Transport {
    /// Plain TCP
    Tcp(TcpStream),
    /// TLS over TCP
    Tls(Box<TlsStream<TcpStream>>),
    /// Unix domain socket
    Unix(UnixStream),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Transport::Tcp(_) => "Transport::Tcp",
            Transport::Tls(_) => "Transport::Tls",
            Transport::Unix(_) => "Transport::Unix",
        })
    }
}

impl Transport {
    /// Connect via plain TCP
    pub async fn connect_tcp(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Transport::Tcp(stream))
    }

    /// Connect via Unix socket
    pub async fn connect_unix(path: &Path) -> Result<Self> {
        Ok(Transport::Unix(UnixStream::connect(path).await?))
    }

    /// Whether the stream is encrypted
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Run the TLS handshake over a plain TCP transport (after the server accepted SSLRequest)
    pub async fn upgrade_to_tls(self, client_config: Arc<ClientConfig>, host: &str) -> Result<Self> {
        let tcp = match self {
            Transport::Tcp(tcp) => tcp,
            Transport::Tls(_) => {
                return Err(Error::Config("transport is already TLS-encrypted".into()))
            }
            Transport::Unix(_) => {
                return Err(Error::Config("cannot upgrade a Unix socket to TLS".into()))
            }
        };

        let server_name = super::tls::server_name(host)?;
        let tls = tokio_rustls::TlsConnector::from(client_config)
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Config(format!("TLS handshake with {} failed: {}", host, e)))?;
        Ok(Transport::Tls(Box::new(tls)))
    }

    fn stream(&mut self) -> &mut dyn Stream {
        match self {
            Transport::Tcp(s) => s,
            Transport::Tls(s) => s.as_mut(),
            Transport::Unix(s) => s,
        }
    }

    /// Write all bytes and flush
    pub async fn send(&mut self, buf: &[u8]) -> Result<()> {
        let stream = self.stream();
        stream.write_all(buf).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read whatever is available into `buf`; `Ok(0)` means EOF
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize> {
        Ok(self.stream().read_buf(buf).await?)
    }

    /// Shut down the write side
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream().shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connect_failure() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = Transport::connect_tcp("127.0.0.1", port).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_unix_connect_failure() {
        let result = Transport::connect_unix(Path::new("/nonexistent/.s.PGSQL.5432")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_send_and_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let mut transport = Transport::connect_tcp("127.0.0.1", port).await.unwrap();
        assert!(!transport.is_tls());
        transport.send(b"ping").await.unwrap();

        let mut buf = BytesMut::new();
        while buf.len() < 4 {
            assert!(transport.read_buf(&mut buf).await.unwrap() > 0);
        }
        assert_eq!(&buf[..], b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unix_cannot_upgrade() {
        let dir = std::env::temp_dir().join(format!("pgbc-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sock");
        let _ = std::fs::remove_file(&path);
        let _listener = tokio::net::UnixListener::bind(&path).unwrap();

        let transport = Transport::connect_unix(&path).await.unwrap();
        let config = tls_client_config();
        let result = transport.upgrade_to_tls(config, "localhost").await;
        assert!(matches!(result, Err(Error::Config(_))));
        let _ = std::fs::remove_file(&path);
    }

    fn tls_client_config() -> Arc<ClientConfig> {
        let config = crate::config::ConnectionConfig::builder()
            .user("u")
            .sslmode(super::super::SslMode::Require)
            .build();
        super::super::tls::client_config(&config).unwrap().unwrap()
    }
}
