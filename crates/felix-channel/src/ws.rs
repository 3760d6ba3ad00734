//! WebSocket channel variant.
//!
//! The listener accepts a TCP connection, runs the HTTP upgrade handshake
//! (101 + `Sec-WebSocket-Accept`), and a failed handshake closes the
//! socket.  After the upgrade every message travels as one WebSocket
//! binary frame whose payload is the usual `<Header><body>` tuple, so WS
//! peers and raw-stream peers share one framing layer.

use crate::channel::ChannelConfig;
use crate::message_io::{
    parse_header, parse_payload, serialize_to_buffer, FrameBuffer, MessageIoError,
};
use felix_protocol::{ChannelSource, Status, StatusCode};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsChannel {
    send: Mutex<SendHalf>,
    recv: Mutex<SplitStream<WsStream>>,
    broken: AtomicBool,
    dynamic_send: AtomicBool,
    dynamic_recv: AtomicBool,
    recv_capacity: AtomicUsize,
}

struct SendHalf {
    sink: SplitSink<WsStream, Message>,
    buffer: FrameBuffer,
}

impl WsChannel {
    pub async fn connect(source: &ChannelSource, config: &ChannelConfig) -> Result<Self, Status> {
        let ChannelSource::Ws { url } = source else {
            return Err(Status::invalid_argument(format!(
                "expected a ws source, got {source}"
            )));
        };
        let (ws, _response) =
            tokio::time::timeout(config.connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| Status::timed_out(format!("connecting to {url}")))?
                .map_err(|e| Status::unavailable(e.to_string()))?;
        Ok(Self::from_stream(ws, config))
    }

    fn from_stream(ws: WsStream, config: &ChannelConfig) -> Self {
        let (sink, stream) = ws.split();
        WsChannel {
            send: Mutex::new(SendHalf {
                sink,
                buffer: FrameBuffer::with_capacity(config.send_buffer_size),
            }),
            recv: Mutex::new(stream),
            broken: AtomicBool::new(false),
            dynamic_send: AtomicBool::new(config.dynamic_send_buffer),
            dynamic_recv: AtomicBool::new(config.dynamic_receive_buffer),
            recv_capacity: AtomicUsize::new(config.receive_buffer_size),
        }
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

    pub fn set_receive_buffer_capacity(&self, capacity: usize) {
        self.recv_capacity.store(capacity, Ordering::Release);
    }

    pub async fn send_message(&self, payload: &[u8]) -> Result<(), Status> {
        if self.is_broken() {
            return Err(Status::new(StatusCode::SocketClosed, "channel is broken"));
        }
        let mut half = self
            .send
            .try_lock()
            .map_err(|_| Status::new(StatusCode::WritingWhileSending, "send already in progress"))?;

        half.buffer.set_dynamic(self.dynamic_send.load(Ordering::Acquire));
        serialize_to_buffer(payload, &mut half.buffer).map_err(Status::from)?;
        let frame = half.buffer.frame().to_vec();
        if let Err(e) = half.sink.send(Message::Binary(frame.into())).await {
            self.mark_broken();
            return Err(Status::new(StatusCode::SocketClosed, e.to_string()));
        }
        Ok(())
    }

    pub async fn receive_message(&self) -> Result<Vec<u8>, Status> {
        if self.is_broken() {
            return Err(Status::new(StatusCode::SocketClosed, "channel is broken"));
        }
        let mut stream = self.recv.try_lock().map_err(|_| {
            Status::new(StatusCode::ReadingWhileReceiving, "receive already in progress")
        })?;

        loop {
            match stream.next().await {
                None => {
                    self.mark_broken();
                    return Err(Status::new(StatusCode::SocketClosed, "peer closed"));
                }
                Some(Err(e)) => {
                    self.mark_broken();
                    return Err(Status::new(StatusCode::SocketClosed, e.to_string()));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let header = match parse_header(&bytes) {
                        Ok(header) => header,
                        Err(_) => {
                            self.mark_broken();
                            return Err(Status::new(
                                StatusCode::CorruptedHeader,
                                "ws frame carries a corrupt header",
                            ));
                        }
                    };
                    let body = match parse_payload(&bytes, header) {
                        Ok(body) => body,
                        Err(_) => {
                            self.mark_broken();
                            return Err(Status::new(
                                StatusCode::CorruptedHeader,
                                "ws frame truncates declared body",
                            ));
                        }
                    };
                    let capacity = self.recv_capacity.load(Ordering::Acquire);
                    if body.len() > capacity && !self.dynamic_recv.load(Ordering::Acquire) {
                        return Err(MessageIoError::NotEnoughBuffer { required: body.len() }.into());
                    }
                    return Ok(body.to_vec());
                }
                Some(Ok(Message::Ping(data))) => {
                    // Best-effort pong; the sink may be mid-send.
                    if let Ok(mut half) = self.send.try_lock() {
                        let _ = half.sink.send(Message::Pong(data)).await;
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    self.mark_broken();
                    return Err(Status::new(StatusCode::SocketClosed, "peer closed"));
                }
                Some(Ok(other)) => {
                    debug!(?other, "ignoring non-binary ws message");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct WsChannelListener {
    listener: TcpListener,
    local: SocketAddr,
}

impl WsChannelListener {
    pub async fn listen(requested: &ChannelSource) -> Result<Self, Status> {
        let ChannelSource::Ws { url } = requested else {
            return Err(Status::invalid_argument(format!(
                "expected a ws source, got {requested}"
            )));
        };
        let addr = url
            .strip_prefix("ws://")
            .ok_or_else(|| Status::invalid_argument(format!("unsupported ws url: {url}")))?;
        let listener = TcpListener::bind(addr).await.map_err(Status::from)?;
        let local = listener.local_addr().map_err(Status::from)?;
        Ok(WsChannelListener { listener, local })
    }

    pub fn channel_source(&self) -> ChannelSource {
        ChannelSource::Ws {
            url: format!("ws://{}", self.local),
        }
    }

    /// Accept one TCP connection and run the upgrade handshake.  A failed
    /// handshake closes the socket and surfaces as an error; the caller's
    /// accept loop continues with the next connection.
    pub async fn accept(&self, config: &ChannelConfig) -> Result<WsChannel, Status> {
        let (stream, _peer) = self.listener.accept().await.map_err(Status::from)?;
        let ws = accept_async(MaybeTlsStream::Plain(stream))
            .await
            .map_err(|e| Status::unavailable(format!("ws handshake: {e}")))?;
        Ok(WsChannel::from_stream(ws, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn handshake_then_binary_round_trip() {
        let config = ChannelConfig::default();
        let listener = WsChannelListener::listen(&ChannelSource::Ws {
            url: "ws://127.0.0.1:0".into(),
        })
        .await
        .unwrap();
        let source = listener.channel_source();

        let (client, server) = tokio::join!(
            WsChannel::connect(&source, &config),
            listener.accept(&config)
        );
        let client = client.unwrap();
        let server = server.unwrap();

        client.send_message(b"over-websocket").await.unwrap();
        let body = timeout(Duration::from_secs(1), server.receive_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body, b"over-websocket");
    }

    #[tokio::test]
    async fn ws_frames_carry_the_stream_header() {
        let config = ChannelConfig::default();
        let listener = WsChannelListener::listen(&ChannelSource::Ws {
            url: "ws://127.0.0.1:0".into(),
        })
        .await
        .unwrap();
        let source = listener.channel_source();

        let (client, server) = tokio::join!(
            WsChannel::connect(&source, &config),
            listener.accept(&config)
        );
        let client = client.unwrap();
        let server = server.unwrap();

        // A raw binary frame without the 8-byte header prefix is corrupt.
        {
            let mut half = client.send.try_lock().unwrap();
            half.sink
                .send(Message::Binary(vec![1, 2, 3].into()))
                .await
                .unwrap();
        }
        let err = timeout(Duration::from_secs(1), server.receive_message())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.code, StatusCode::CorruptedHeader);
    }

    #[test]
    fn listener_rejects_wss_urls() {
        // TLS termination is out of scope for the embedded listener.
        let err = futures_util::FutureExt::now_or_never(WsChannelListener::listen(
            &ChannelSource::Ws {
                url: "wss://127.0.0.1:0".into(),
            },
        ))
        .unwrap()
        .unwrap_err();
        assert_eq!(err.code, StatusCode::InvalidArgument);
    }
}
