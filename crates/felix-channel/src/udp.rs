//! UDP channel variant.
//!
//! Each datagram carries exactly one `<Header><body>` frame; a truncated
//! datagram is a corrupted frame.  Connecting binds a local port, records
//! the remote address and announces itself with an empty frame so the
//! publisher's accept loop learns the peer.  Accepted peers are send-only:
//! inbound datagrams always land on the listener socket.

use crate::channel::ChannelConfig;
use crate::header::{Header, HEADER_LEN, MAX_FRAME_LEN};
use crate::message_io::{serialize_to_buffer, FrameBuffer, MessageIoError};
use felix_protocol::{ChannelSource, Status, StatusCode};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

/// Largest UDP payload we will attempt to send in one datagram.
const MAX_DATAGRAM_LEN: usize = 64 * 1024;

pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    /// Connected sockets receive; accepted peers only send.
    receives: bool,
    send: Mutex<FrameBuffer>,
    recv: Mutex<Vec<u8>>,
    broken: AtomicBool,
    dynamic_send: AtomicBool,
    dynamic_recv: AtomicBool,
    recv_capacity: AtomicUsize,
}

impl UdpChannel {
    /// Bind a local port, record `source` as the remote address, and send
    /// an empty announce frame so the remote's accept loop sees us.
    pub async fn connect(source: &ChannelSource, config: &ChannelConfig) -> Result<Self, Status> {
        let ChannelSource::Udp { addr } = source else {
            return Err(Status::invalid_argument(format!(
                "expected a udp source, got {source}"
            )));
        };
        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(Status::from)?;
        socket.connect(addr).await.map_err(Status::from)?;

        let channel = UdpChannel::new(Arc::new(socket), *addr, true, config);
        channel.send_message(b"").await.map_err(|s| s.with_context("announce"))?;
        Ok(channel)
    }

    fn new(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        receives: bool,
        config: &ChannelConfig,
    ) -> Self {
        UdpChannel {
            socket,
            remote,
            receives,
            send: Mutex::new(FrameBuffer::with_capacity(config.send_buffer_size)),
            recv: Mutex::new(vec![0u8; MAX_DATAGRAM_LEN]),
            broken: AtomicBool::new(false),
            dynamic_send: AtomicBool::new(config.dynamic_send_buffer),
            dynamic_recv: AtomicBool::new(config.dynamic_receive_buffer),
            recv_capacity: AtomicUsize::new(config.receive_buffer_size),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub fn set_dynamic_send_buffer(&self, dynamic: bool) {
        self.dynamic_send.store(dynamic, Ordering::Release);
    }

    pub fn set_dynamic_receive_buffer(&self, dynamic: bool) {
        self.dynamic_recv.store(dynamic, Ordering::Release);
    }

    pub fn set_receive_buffer_capacity(&self, capacity: usize) {
        self.recv_capacity.store(capacity, Ordering::Release);
    }

    pub async fn send_message(&self, payload: &[u8]) -> Result<(), Status> {
        if self.is_broken() {
            return Err(Status::new(StatusCode::SocketClosed, "channel is broken"));
        }
        let mut buffer = self
            .send
            .try_lock()
            .map_err(|_| Status::new(StatusCode::WritingWhileSending, "send already in progress"))?;

        buffer.set_dynamic(self.dynamic_send.load(Ordering::Acquire));
        let frame_len = serialize_to_buffer(payload, &mut buffer).map_err(Status::from)?;
        if frame_len > MAX_DATAGRAM_LEN {
            return Err(Status::invalid_argument(format!(
                "frame of {frame_len} bytes does not fit one datagram"
            )));
        }

        let sent = if self.receives {
            self.socket.send(buffer.frame()).await
        } else {
            self.socket.send_to(buffer.frame(), self.remote).await
        };
        match sent {
            Ok(_) => Ok(()),
            Err(e) => {
                self.broken.store(true, Ordering::Release);
                Err(Status::new(StatusCode::SocketClosed, e.to_string()))
            }
        }
    }

    pub async fn receive_message(&self) -> Result<Vec<u8>, Status> {
        if self.is_broken() {
            return Err(Status::new(StatusCode::SocketClosed, "channel is broken"));
        }
        if !self.receives {
            return Err(Status::internal(
                "accepted udp peers are send-only; receive on the listener side",
            ));
        }
        let mut scratch = self.recv.try_lock().map_err(|_| {
            Status::new(StatusCode::ReadingWhileReceiving, "receive already in progress")
        })?;

        loop {
            let len = match self.socket.recv(&mut scratch).await {
                Ok(len) => len,
                Err(e) => {
                    self.broken.store(true, Ordering::Release);
                    return Err(Status::new(StatusCode::SocketClosed, e.to_string()));
                }
            };
            match parse_datagram(&scratch[..len]) {
                Ok(None) => continue, // bare announce frame
                Ok(Some(body)) => {
                    let capacity = self.recv_capacity.load(Ordering::Acquire);
                    if body.len() > capacity && !self.dynamic_recv.load(Ordering::Acquire) {
                        return Err(MessageIoError::NotEnoughBuffer { required: body.len() }.into());
                    }
                    return Ok(body.to_vec());
                }
                Err(status) => {
                    self.broken.store(true, Ordering::Release);
                    return Err(status);
                }
            }
        }
    }
}

/// One datagram, one frame.  `Ok(None)` is an empty announce frame.
fn parse_datagram(datagram: &[u8]) -> Result<Option<&[u8]>, Status> {
    let header_bytes: &[u8; HEADER_LEN] = datagram
        .get(..HEADER_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| {
            Status::new(StatusCode::CorruptedHeader, "datagram shorter than a header")
        })?;
    let header = Header::decode(header_bytes, MAX_FRAME_LEN)?;
    let body_len = header.payload_len() as usize;
    let body = datagram.get(HEADER_LEN..HEADER_LEN + body_len).ok_or_else(|| {
        Status::new(StatusCode::CorruptedHeader, "datagram truncates declared body")
    })?;
    if body.is_empty() {
        return Ok(None);
    }
    Ok(Some(body))
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Publisher-side UDP endpoint.  There is no OS-level accept for UDP;
/// every datagram from a not-yet-seen address introduces a new peer.
pub struct UdpChannelListener {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    seen: Mutex<HashSet<SocketAddr>>,
    scratch: Mutex<Vec<u8>>,
}

impl UdpChannelListener {
    pub async fn listen(requested: &ChannelSource) -> Result<Self, Status> {
        let ChannelSource::Udp { addr } = requested else {
            return Err(Status::invalid_argument(format!(
                "expected a udp source, got {requested}"
            )));
        };
        let socket = UdpSocket::bind(addr).await.map_err(Status::from)?;
        let local = socket.local_addr().map_err(Status::from)?;
        Ok(UdpChannelListener {
            socket: Arc::new(socket),
            local,
            seen: Mutex::new(HashSet::new()),
            scratch: Mutex::new(vec![0u8; MAX_DATAGRAM_LEN]),
        })
    }

    pub fn channel_source(&self) -> ChannelSource {
        ChannelSource::Udp { addr: self.local }
    }

    /// Wait for a datagram from a new address and hand back a send-only
    /// channel for that peer.
    pub async fn accept(&self, config: &ChannelConfig) -> Result<UdpChannel, Status> {
        let mut scratch = self.scratch.lock().await;
        loop {
            let (_len, from) = self
                .socket
                .recv_from(&mut scratch)
                .await
                .map_err(Status::from)?;
            let mut seen = self.seen.lock().await;
            if seen.insert(from) {
                return Ok(UdpChannel::new(self.socket.clone(), from, false, config));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn announce_then_publish_flows_to_subscriber() {
        let config = ChannelConfig::default();
        let listener = UdpChannelListener::listen(&ChannelSource::Udp {
            addr: "127.0.0.1:0".parse().unwrap(),
        })
        .await
        .unwrap();
        let source = listener.channel_source();

        let (subscriber, peer) = tokio::join!(
            UdpChannel::connect(&source, &config),
            listener.accept(&config)
        );
        let subscriber = subscriber.unwrap();
        let peer = peer.unwrap();

        peer.send_message(b"datagram-1").await.unwrap();
        let body = timeout(Duration::from_secs(1), subscriber.receive_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body, b"datagram-1");
    }

    #[test]
    fn truncated_datagram_is_corrupted_header() {
        // Declares a 100-byte body but carries none.
        let err = parse_datagram(&[100, 0, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err.code, StatusCode::CorruptedHeader);
        // Shorter than a header.
        let err = parse_datagram(&[1, 2, 3]).unwrap_err();
        assert_eq!(err.code, StatusCode::CorruptedHeader);
    }

    #[test]
    fn announce_frame_parses_as_none() {
        let announce = crate::header::Header::new(0).encode();
        assert!(parse_datagram(&announce).unwrap().is_none());
    }
}
