//! Raw wire-level peers.
//!
//! These bypass the channel layer on purpose: a test that wants to pause
//! reads, inject a corrupt header, or count exact bytes needs a plain
//! socket, not a well-behaved channel.

use byteorder::{ByteOrder, LittleEndian};
use felix_protocol::ChannelSource;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A fake publisher endpoint: accepts one subscriber connection and
/// writes whatever bytes the test decides.
pub struct RawTopicEndpoint {
    listener: TcpListener,
    addr: SocketAddr,
    peer: Option<TcpStream>,
}

impl RawTopicEndpoint {
    pub async fn bind() -> std::io::Result<RawTopicEndpoint> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        Ok(RawTopicEndpoint {
            listener,
            addr,
            peer: None,
        })
    }

    /// The source to advertise in a `TopicInfo`.
    pub fn channel_source(&self) -> ChannelSource {
        ChannelSource::Tcp { addr: self.addr }
    }

    /// Wait for one subscriber to connect.
    pub async fn accept(&mut self) -> std::io::Result<()> {
        let (stream, _peer) = self.listener.accept().await?;
        self.peer = Some(stream);
        Ok(())
    }

    /// Send a well-formed frame.
    pub async fn send_frame(&mut self, payload: &[u8]) -> std::io::Result<()> {
        let mut header = [0u8; 8];
        LittleEndian::write_u32(&mut header[0..4], payload.len() as u32);
        let peer = self.peer.as_mut().expect("no subscriber accepted yet");
        peer.write_all(&header).await?;
        peer.write_all(payload).await?;
        Ok(())
    }

    /// Send arbitrary bytes, e.g. a corrupt header.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let peer = self.peer.as_mut().expect("no subscriber accepted yet");
        peer.write_all(bytes).await
    }

    /// Drop the subscriber connection.
    pub fn disconnect(&mut self) {
        self.peer = None;
    }
}

/// A wire-level subscriber: connects to a publisher's advertised TCP
/// source and reads frames only when the test asks it to.
pub struct RawSubscriber {
    stream: TcpStream,
}

impl RawSubscriber {
    pub async fn connect(source: &ChannelSource) -> std::io::Result<RawSubscriber> {
        let ChannelSource::Tcp { addr } = source else {
            return Err(std::io::Error::other("raw subscriber only speaks tcp"));
        };
        let stream = TcpStream::connect(addr).await?;
        Ok(RawSubscriber { stream })
    }

    /// Read exactly one `<Header><payload>` frame.
    pub async fn read_frame(&mut self) -> std::io::Result<Vec<u8>> {
        let mut header = [0u8; 8];
        self.stream.read_exact(&mut header).await?;
        let len = LittleEndian::read_u32(&header[0..4]) as usize;
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await?;
        Ok(payload)
    }
}
