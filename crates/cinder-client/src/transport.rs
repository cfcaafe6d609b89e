//! The seam between the engine and the byte stream it runs over.
//!
//! A [`Connector`] turns an [`Endpoint`] into a connected, bidirectional
//! stream. [`TcpConnector`] is the production implementation; tests plug
//! in in-memory streams.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::routing::Endpoint;

/// Any bidirectional byte stream a connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxTransport = Box<dyn Transport>;

pub type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<BoxTransport>> + Send>>;

/// Opens transports to endpoints.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, endpoint: &Endpoint) -> ConnectFuture;
}

impl<F> Connector for F
where
    F: Fn(&Endpoint) -> ConnectFuture + Send + Sync + 'static,
{
    fn connect(&self, endpoint: &Endpoint) -> ConnectFuture {
        self(endpoint)
    }
}

/// Connects over TCP with `TCP_NODELAY` set.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl Connector for TcpConnector {
    fn connect(&self, endpoint: &Endpoint) -> ConnectFuture {
        let host = endpoint.host().to_string();
        let port = endpoint.port();
        let limit = self.connect_timeout;
        Box::pin(async move {
            let stream = tokio::time::timeout(limit, TcpStream::connect((host.as_str(), port)))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {host}:{port} timed out"),
                    )
                })??;
            stream.set_nodelay(true)?;
            debug!("tcp connected to {host}:{port}");
            Ok(Box::new(stream) as BoxTransport)
        })
    }
}
