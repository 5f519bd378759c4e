//! Byte-stream transports a session can run over.

use crate::error::{Result, TuyaError};
use futures_util::future::BoxFuture;
use log::debug;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

pub const DEFAULT_PORT: u16 = 6668;

/// Anything that can carry the framed protocol.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxTransport = Box<dyn Transport>;

/// Opens a fresh transport for every (re)connect attempt.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<BoxTransport>>;
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> BoxFuture<'_, Result<BoxTransport>> {
        Box::pin(async move {
            let addr = self.address();
            debug!("Opening TCP connection to {}", addr);
            let stream = TcpStream::connect(&addr).await.map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => TuyaError::ConnectionFailed,
                _ => TuyaError::Io(e.to_string()),
            })?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxTransport)
        })
    }
}

/// Adapts an async closure into a [`Connector`].
pub struct FnConnector<F>(pub F);

impl<F, Fut> Connector for FnConnector<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BoxTransport>> + Send + 'static,
{
    fn connect(&self) -> BoxFuture<'_, Result<BoxTransport>> {
        Box::pin((self.0)())
    }
}
