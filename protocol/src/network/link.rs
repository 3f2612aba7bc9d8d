//! The substrate a gossip channel runs on.
//!
//! The transport does not care how two peers found each other. It asks a
//! [`Connector`] for a byte stream per channel and speaks frames over it.
//! Production nodes dial a rendezvous endpoint over TCP; tests plug in
//! in-memory duplex pipes.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Anything a channel can read frames from and write frames to.
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> LinkStream for T {}

pub type BoxedStream = Box<dyn LinkStream>;

/// Produces one fresh stream per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens a stream for `channel`. The transport bounds the call with the
    /// connection attempt deadline, so implementations need no timeout.
    async fn connect(&self, channel: usize) -> io::Result<BoxedStream>;
}

/// Dials a random signaling endpoint over TCP.
///
/// ICE servers are carried for connectors that negotiate NAT traversal;
/// plain TCP ignores them.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    endpoints: Vec<String>,
    ice_servers: Vec<String>,
}

impl TcpConnector {
    pub fn new(endpoints: Vec<String>, ice_servers: Vec<String>) -> Self {
        Self {
            endpoints,
            ice_servers,
        }
    }

    pub fn ice_servers(&self) -> &[String] {
        &self.ice_servers
    }

    fn pick_endpoint(&self) -> io::Result<String> {
        self.endpoints
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no signaling servers configured"))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, channel: usize) -> io::Result<BoxedStream> {
        let endpoint = self.pick_endpoint()?;
        debug!(channel, %endpoint, "dialing");
        let stream = TcpStream::connect(&endpoint).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
