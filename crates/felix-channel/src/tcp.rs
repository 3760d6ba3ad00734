//! TCP channel variant.
//!
//! Stream framing follows the WAIT_HEADER → WAIT_BODY(n) → DELIVER state
//! machine.  A fixed receive buffer that is too small for the announced
//! body fails with `NotEnoughBuffer` while *keeping* the pending header,
//! so the caller can grow the buffer and resume the same frame.

use crate::channel::ChannelConfig;
use crate::header::{Header, HEADER_LEN, MAX_FRAME_LEN};
use crate::message_io::{serialize_to_buffer, FrameBuffer, MessageIoError};
use felix_protocol::{ChannelSource, Status, StatusCode};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

#[derive(Debug)]
pub struct TcpChannel {
    peer: SocketAddr,
    send: Mutex<SendHalf>,
    recv: Mutex<RecvHalf>,
    broken: AtomicBool,
    dynamic_send: AtomicBool,
    dynamic_recv: AtomicBool,
    send_capacity: AtomicUsize,
    recv_capacity: AtomicUsize,
}

#[derive(Debug)]
struct SendHalf {
    write: OwnedWriteHalf,
    buffer: FrameBuffer,
}

#[derive(Debug)]
struct RecvHalf {
    read: OwnedReadHalf,
    /// Header of a frame whose body has not been delivered yet.
    pending: Option<Header>,
}

impl TcpChannel {
    /// Establish a connection to `source` within the configured timeout.
    pub async fn connect(source: &ChannelSource, config: &ChannelConfig) -> Result<Self, Status> {
        let ChannelSource::Tcp { addr } = source else {
            return Err(Status::invalid_argument(format!(
                "expected a tcp source, got {source}"
            )));
        };
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Status::timed_out(format!("connecting to {addr}")))?
            .map_err(Status::from)?;
        Ok(Self::from_stream(stream, config))
    }

    pub fn from_stream(stream: TcpStream, config: &ChannelConfig) -> Self {
        let peer = stream
            .peer_addr()
            .unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
        let (read, write) = stream.into_split();
        TcpChannel {
            peer,
            send: Mutex::new(SendHalf {
                write,
                buffer: FrameBuffer::with_capacity(config.send_buffer_size),
            }),
            recv: Mutex::new(RecvHalf { read, pending: None }),
            broken: AtomicBool::new(false),
            dynamic_send: AtomicBool::new(config.dynamic_send_buffer),
            dynamic_recv: AtomicBool::new(config.dynamic_receive_buffer),
            send_capacity: AtomicUsize::new(config.send_buffer_size),
            recv_capacity: AtomicUsize::new(config.receive_buffer_size),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    pub fn set_dynamic_send_buffer(&self, dynamic: bool) {
        self.dynamic_send.store(dynamic, Ordering::Release);
    }

    pub fn set_dynamic_receive_buffer(&self, dynamic: bool) {
        self.dynamic_recv.store(dynamic, Ordering::Release);
    }

    pub fn set_send_buffer_capacity(&self, capacity: usize) {
        self.send_capacity.store(capacity, Ordering::Release);
    }

    pub fn set_receive_buffer_capacity(&self, capacity: usize) {
        self.recv_capacity.store(capacity, Ordering::Release);
    }

    /// Frame `payload` and write it.  At most one send may be outstanding.
    pub async fn send_message(&self, payload: &[u8]) -> Result<(), Status> {
        if self.is_broken() {
            return Err(Status::new(StatusCode::SocketClosed, "channel is broken"));
        }
        let mut half = self
            .send
            .try_lock()
            .map_err(|_| Status::new(StatusCode::WritingWhileSending, "send already in progress"))?;

        half.buffer.set_dynamic(self.dynamic_send.load(Ordering::Acquire));
        let capacity = self.send_capacity.load(Ordering::Acquire);
        if half.buffer.capacity() < capacity {
            half.buffer.resize_capacity(capacity);
        }
        serialize_to_buffer(payload, &mut half.buffer).map_err(Status::from)?;

        let SendHalf { write, buffer } = &mut *half;
        if let Err(e) = write.write_all(buffer.frame()).await {
            self.mark_broken();
            return Err(Status::new(StatusCode::SocketClosed, e.to_string()));
        }
        Ok(())
    }

    /// Read exactly one framed message.  At most one receive may be
    /// outstanding.
    pub async fn receive_message(&self) -> Result<Vec<u8>, Status> {
        if self.is_broken() {
            return Err(Status::new(StatusCode::SocketClosed, "channel is broken"));
        }
        let mut half = self.recv.try_lock().map_err(|_| {
            Status::new(StatusCode::ReadingWhileReceiving, "receive already in progress")
        })?;

        // WAIT_HEADER, unless a previous call left a body pending.
        let header = match half.pending.take() {
            Some(header) => header,
            None => {
                let mut bytes = [0u8; HEADER_LEN];
                if let Err(e) = half.read.read_exact(&mut bytes).await {
                    self.mark_broken();
                    return Err(read_error_status(&e));
                }
                match Header::decode(&bytes, MAX_FRAME_LEN) {
                    Ok(header) => header,
                    Err(status) => {
                        self.mark_broken();
                        return Err(status);
                    }
                }
            }
        };

        // WAIT_BODY(n)
        let body_len = header.payload_len() as usize;
        let capacity = self.recv_capacity.load(Ordering::Acquire);
        if body_len > capacity && !self.dynamic_recv.load(Ordering::Acquire) {
            // Remember the header so the caller can resize and resume.
            half.pending = Some(header);
            return Err(MessageIoError::NotEnoughBuffer { required: body_len }.into());
        }

        let mut body = vec![0u8; body_len];
        if let Err(e) = half.read.read_exact(&mut body).await {
            self.mark_broken();
            return Err(read_error_status(&e));
        }
        Ok(body)
    }

    /// Used when a higher layer decides the peer is misbehaving.
    pub fn close(&self) {
        self.mark_broken();
    }
}

fn read_error_status(e: &std::io::Error) -> Status {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset => {
            Status::new(StatusCode::SocketClosed, e.to_string())
        }
        _ => Status::new(StatusCode::SocketClosed, e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

pub struct TcpChannelListener {
    listener: TcpListener,
    local: SocketAddr,
}

impl TcpChannelListener {
    /// Bind a local endpoint; port 0 resolves to an OS-assigned port.
    pub async fn listen(requested: &ChannelSource) -> Result<Self, Status> {
        let ChannelSource::Tcp { addr } = requested else {
            return Err(Status::invalid_argument(format!(
                "expected a tcp source, got {requested}"
            )));
        };
        let listener = TcpListener::bind(addr).await.map_err(Status::from)?;
        let local = listener.local_addr().map_err(Status::from)?;
        Ok(TcpChannelListener { listener, local })
    }

    pub fn channel_source(&self) -> ChannelSource {
        ChannelSource::Tcp { addr: self.local }
    }

    pub async fn accept(&self, config: &ChannelConfig) -> Result<TcpChannel, Status> {
        let (stream, _peer) = self.listener.accept().await.map_err(Status::from)?;
        Ok(TcpChannel::from_stream(stream, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    async fn pair() -> (TcpChannel, TcpChannel) {
        let config = ChannelConfig::default();
        let listener = TcpChannelListener::listen(&ChannelSource::Tcp {
            addr: "127.0.0.1:0".parse().unwrap(),
        })
        .await
        .unwrap();
        let source = listener.channel_source();
        let (client, server) = tokio::join!(
            TcpChannel::connect(&source, &config),
            listener.accept(&config)
        );
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn send_receive_round_trip() {
        let (client, server) = pair().await;
        client.send_message(b"hello\0").await.unwrap();
        client.send_message(b"world\0").await.unwrap();
        assert_eq!(server.receive_message().await.unwrap(), b"hello\0");
        assert_eq!(server.receive_message().await.unwrap(), b"world\0");
    }

    #[tokio::test]
    async fn fixed_receive_buffer_reports_required_then_resumes() {
        let (client, server) = pair().await;
        server.set_dynamic_receive_buffer(false);
        server.set_receive_buffer_capacity(8);

        client.send_message(&vec![7u8; 100]).await.unwrap();

        let err = timeout(Duration::from_secs(1), server.receive_message())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.code, StatusCode::NotEnoughBuffer);

        server.set_receive_buffer_capacity(128);
        let body = timeout(Duration::from_secs(1), server.receive_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body, vec![7u8; 100]);
    }

    #[tokio::test]
    async fn corrupted_header_breaks_channel() {
        let config = ChannelConfig::default();
        let listener = TcpChannelListener::listen(&ChannelSource::Tcp {
            addr: "127.0.0.1:0".parse().unwrap(),
        })
        .await
        .unwrap();
        let source = listener.channel_source();
        let ChannelSource::Tcp { addr } = source else { unreachable!() };

        let (raw, server) = tokio::join!(TcpStream::connect(addr), listener.accept(&config));
        let mut raw = raw.unwrap();
        let server = server.unwrap();

        // Declared length 0xFFFFFFFF: larger than any channel maximum.
        raw.write_all(&[0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0]).await.unwrap();

        let err = server.receive_message().await.unwrap_err();
        assert_eq!(err.code, StatusCode::CorruptedHeader);
        assert!(server.is_broken());

        let err = server.receive_message().await.unwrap_err();
        assert_eq!(err.code, StatusCode::SocketClosed);
    }

    #[tokio::test]
    async fn connect_to_dead_port_fails() {
        let config = ChannelConfig {
            connect_timeout: Duration::from_millis(500),
            ..ChannelConfig::default()
        };
        // Bind then drop to get a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpChannel::connect(&ChannelSource::Tcp { addr }, &config)
            .await
            .unwrap_err();
        assert!(matches!(
            err.code,
            StatusCode::Unavailable | StatusCode::TimedOut
        ));
    }
}
