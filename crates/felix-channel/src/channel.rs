//! The polymorphic channel.
//!
//! [`Channel`] is a tagged variant over the four transports; every match
//! is exhaustive and no downcast primitive is exposed.  The concurrency
//! contract is uniform: at most one outstanding send and one outstanding
//! receive per channel, refused with `WritingWhileSending` /
//! `ReadingWhileReceiving` rather than queued.

use crate::shm::{ShmChannel, ShmChannelListener};
use crate::tcp::{TcpChannel, TcpChannelListener};
use crate::udp::{UdpChannel, UdpChannelListener};
use crate::ws::{WsChannel, WsChannelListener};
use felix_protocol::{ChannelKind, ChannelSource, Status};
use std::time::Duration;

pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffer and timeout knobs shared by every variant.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub send_buffer_size: usize,
    pub receive_buffer_size: usize,
    pub dynamic_send_buffer: bool,
    pub dynamic_receive_buffer: bool,
    pub connect_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            send_buffer_size: DEFAULT_BUFFER_SIZE,
            receive_buffer_size: DEFAULT_BUFFER_SIZE,
            dynamic_send_buffer: false,
            dynamic_receive_buffer: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

pub enum Channel {
    Tcp(TcpChannel),
    Udp(UdpChannel),
    Shm(ShmChannel),
    Ws(WsChannel),
}

impl Channel {
    /// Establish a peer connection to `source`.
    pub async fn connect(source: &ChannelSource, config: &ChannelConfig) -> Result<Self, Status> {
        match source.kind() {
            ChannelKind::Tcp => Ok(Channel::Tcp(TcpChannel::connect(source, config).await?)),
            ChannelKind::Udp => Ok(Channel::Udp(UdpChannel::connect(source, config).await?)),
            ChannelKind::Shm => Ok(Channel::Shm(ShmChannel::connect(source, config)?)),
            ChannelKind::Ws => Ok(Channel::Ws(WsChannel::connect(source, config).await?)),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            Channel::Tcp(_) => ChannelKind::Tcp,
            Channel::Udp(_) => ChannelKind::Udp,
            Channel::Shm(_) => ChannelKind::Shm,
            Channel::Ws(_) => ChannelKind::Ws,
        }
    }

    pub fn is_broken(&self) -> bool {
        match self {
            Channel::Tcp(c) => c.is_broken(),
            Channel::Udp(c) => c.is_broken(),
            Channel::Shm(c) => c.is_broken(),
            Channel::Ws(c) => c.is_broken(),
        }
    }

    pub async fn send_message(&self, payload: &[u8]) -> Result<(), Status> {
        match self {
            Channel::Tcp(c) => c.send_message(payload).await,
            Channel::Udp(c) => c.send_message(payload).await,
            Channel::Shm(c) => c.send_message(payload).await,
            Channel::Ws(c) => c.send_message(payload).await,
        }
    }

    pub async fn receive_message(&self) -> Result<Vec<u8>, Status> {
        match self {
            Channel::Tcp(c) => c.receive_message().await,
            Channel::Udp(c) => c.receive_message().await,
            Channel::Shm(c) => c.receive_message().await,
            Channel::Ws(c) => c.receive_message().await,
        }
    }

    pub fn set_dynamic_send_buffer(&self, dynamic: bool) {
        match self {
            Channel::Tcp(c) => c.set_dynamic_send_buffer(dynamic),
            Channel::Udp(c) => c.set_dynamic_send_buffer(dynamic),
            Channel::Shm(_) => {}
            Channel::Ws(c) => c.set_dynamic_send_buffer(dynamic),
        }
    }

    pub fn set_dynamic_receive_buffer(&self, dynamic: bool) {
        match self {
            Channel::Tcp(c) => c.set_dynamic_receive_buffer(dynamic),
            Channel::Udp(c) => c.set_dynamic_receive_buffer(dynamic),
            Channel::Shm(c) => c.set_dynamic_receive_buffer(dynamic),
            Channel::Ws(c) => c.set_dynamic_receive_buffer(dynamic),
        }
    }

    pub fn set_receive_buffer_capacity(&self, capacity: usize) {
        match self {
            Channel::Tcp(c) => c.set_receive_buffer_capacity(capacity),
            Channel::Udp(c) => c.set_receive_buffer_capacity(capacity),
            Channel::Shm(c) => c.set_receive_buffer_capacity(capacity),
            Channel::Ws(c) => c.set_receive_buffer_capacity(capacity),
        }
    }

    /// Short label for logs: the peer endpoint where the variant has one.
    pub fn describe(&self) -> String {
        match self {
            Channel::Tcp(c) => format!("tcp:{}", c.peer_addr()),
            Channel::Udp(c) => format!("udp:{}", c.remote_addr()),
            Channel::Shm(c) => format!("shm:{}", c.segment_name()),
            Channel::Ws(_) => "ws".to_owned(),
        }
    }
}

/// Listening endpoint, resolved from a placeholder source.
///
/// TCP/WS/UDP accept peers; SHM has no per-reader accept — the segment's
/// single writer channel reaches every attached reader.
pub enum ChannelListener {
    Tcp(TcpChannelListener),
    Udp(UdpChannelListener),
    Shm(ShmChannelListener),
    Ws(WsChannelListener),
}

impl ChannelListener {
    /// Bind the endpoint described by `requested` (usually a
    /// `ChannelSource::pick_random` placeholder) and resolve its address.
    pub async fn listen(requested: &ChannelSource) -> Result<Self, Status> {
        match requested.kind() {
            ChannelKind::Tcp => Ok(ChannelListener::Tcp(
                TcpChannelListener::listen(requested).await?,
            )),
            ChannelKind::Udp => Ok(ChannelListener::Udp(
                UdpChannelListener::listen(requested).await?,
            )),
            ChannelKind::Shm => Ok(ChannelListener::Shm(ShmChannelListener::listen(requested)?)),
            ChannelKind::Ws => Ok(ChannelListener::Ws(
                WsChannelListener::listen(requested).await?,
            )),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelListener::Tcp(_) => ChannelKind::Tcp,
            ChannelListener::Udp(_) => ChannelKind::Udp,
            ChannelListener::Shm(_) => ChannelKind::Shm,
            ChannelListener::Ws(_) => ChannelKind::Ws,
        }
    }

    /// The fully resolved source to advertise to the master.
    pub fn channel_source(&self) -> ChannelSource {
        match self {
            ChannelListener::Tcp(l) => l.channel_source(),
            ChannelListener::Udp(l) => l.channel_source(),
            ChannelListener::Shm(l) => l.channel_source(),
            ChannelListener::Ws(l) => l.channel_source(),
        }
    }

    /// Wait for the next peer.  For SHM this returns the standing writer
    /// channel once and then pends forever.
    pub async fn accept(&self, config: &ChannelConfig) -> Result<Channel, Status> {
        match self {
            ChannelListener::Tcp(l) => Ok(Channel::Tcp(l.accept(config).await?)),
            ChannelListener::Udp(l) => Ok(Channel::Udp(l.accept(config).await?)),
            ChannelListener::Shm(_) => std::future::pending().await,
            ChannelListener::Ws(l) => Ok(Channel::Ws(l.accept(config).await?)),
        }
    }

    /// The standing SHM writer channel, if this is an SHM listener.
    pub fn shm_writer(&self, config: &ChannelConfig) -> Option<Channel> {
        match self {
            ChannelListener::Shm(l) => Some(Channel::Shm(l.writer(config))),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn listen_resolves_placeholder_sources() {
        for kind in [ChannelKind::Tcp, ChannelKind::Udp, ChannelKind::Shm, ChannelKind::Ws] {
            let listener = ChannelListener::listen(&ChannelSource::pick_random(kind))
                .await
                .unwrap();
            let source = listener.channel_source();
            assert_eq!(source.kind(), kind);
            assert!(source.is_valid(), "{source} should be resolved");
        }
    }

    #[tokio::test]
    async fn enum_dispatch_round_trip_over_tcp() {
        let config = ChannelConfig::default();
        let listener = ChannelListener::listen(&ChannelSource::pick_random(ChannelKind::Tcp))
            .await
            .unwrap();
        let source = listener.channel_source();

        let (client, server) = tokio::join!(
            Channel::connect(&source, &config),
            listener.accept(&config)
        );
        let client = client.unwrap();
        let server = server.unwrap();
        assert_eq!(client.kind(), ChannelKind::Tcp);

        client.send_message(b"ping").await.unwrap();
        let body = timeout(Duration::from_secs(1), server.receive_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body, b"ping");
    }
}
