//! Shared-memory channel variant.
//!
//! A segment is a named single-writer ring buffer registered in a
//! process-wide map.  Frames carry a monotonically increasing sequence;
//! the write side publishes under the ring lock (write-then-publish), and
//! readers wait on a watch of the last published sequence instead of
//! polling.  A reader that falls behind the retention window skips forward
//! to the oldest retained frame.

use crate::channel::ChannelConfig;
use crate::header::HEADER_LEN;
use crate::message_io::MessageIoError;
use felix_protocol::{ChannelSource, Status, StatusCode};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use tokio::sync::{watch, Mutex};

// ---------------------------------------------------------------------------
// Segment registry
// ---------------------------------------------------------------------------

static REGISTRY: OnceLock<StdMutex<HashMap<String, Arc<ShmSegment>>>> = OnceLock::new();

fn registry() -> &'static StdMutex<HashMap<String, Arc<ShmSegment>>> {
    REGISTRY.get_or_init(|| StdMutex::new(HashMap::new()))
}

#[derive(Debug)]
pub struct ShmSegment {
    name: String,
    /// Byte budget for retained frames; oldest frames are evicted first.
    capacity: usize,
    ring: StdMutex<Ring>,
    /// Last published sequence; the reader-side wake primitive.
    published: watch::Sender<u64>,
}

#[derive(Debug)]
struct Ring {
    /// Contiguous sequences: front frame has seq `next_seq - frames.len()`.
    frames: VecDeque<(u64, Arc<Vec<u8>>)>,
    next_seq: u64,
    buffered: usize,
    closed: bool,
}

impl ShmSegment {
    /// Create and register a fresh segment.
    pub fn create(name: &str, capacity: usize) -> Result<Arc<ShmSegment>, Status> {
        let mut map = registry().lock().expect("shm registry poisoned");
        if map.contains_key(name) {
            return Err(Status::already_exists(format!("shm segment {name}")));
        }
        let (published, _) = watch::channel(0);
        let segment = Arc::new(ShmSegment {
            name: name.to_owned(),
            capacity,
            ring: StdMutex::new(Ring {
                frames: VecDeque::new(),
                next_seq: 1,
                buffered: 0,
                closed: false,
            }),
            published,
        });
        map.insert(name.to_owned(), segment.clone());
        Ok(segment)
    }

    /// Attach to an existing segment by name.
    pub fn attach(name: &str) -> Result<Arc<ShmSegment>, Status> {
        registry()
            .lock()
            .expect("shm registry poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("shm segment {name}")))
    }

    /// Unregister the segment and wake all readers with a closed ring.
    pub fn unlink(name: &str) {
        let segment = registry().lock().expect("shm registry poisoned").remove(name);
        if let Some(segment) = segment {
            segment.ring.lock().expect("shm ring poisoned").closed = true;
            let last = *segment.published.borrow();
            let _ = segment.published.send(last);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, payload: Arc<Vec<u8>>) -> Result<u64, Status> {
        let frame_len = HEADER_LEN + payload.len();
        if frame_len > self.capacity {
            return Err(MessageIoError::NotEnoughBuffer { required: frame_len }.into());
        }
        let seq;
        {
            let mut ring = self.ring.lock().expect("shm ring poisoned");
            if ring.closed {
                return Err(Status::new(StatusCode::SocketClosed, "segment unlinked"));
            }
            seq = ring.next_seq;
            ring.next_seq += 1;
            ring.buffered += frame_len;
            ring.frames.push_back((seq, payload));
            while ring.buffered > self.capacity && ring.frames.len() > 1 {
                if let Some((_, evicted)) = ring.frames.pop_front() {
                    ring.buffered -= HEADER_LEN + evicted.len();
                }
            }
        }
        // Publish after the frame is visible under the lock.
        let _ = self.published.send(seq);
        Ok(seq)
    }

    /// Pop the frame at `cursor`, skipping forward if it was evicted.
    /// Returns `None` when nothing at or past the cursor is retained yet.
    fn read_at(&self, cursor: &mut u64) -> Result<Option<Arc<Vec<u8>>>, Status> {
        let ring = self.ring.lock().expect("shm ring poisoned");
        let front_seq = ring.next_seq - ring.frames.len() as u64;
        if *cursor < front_seq {
            *cursor = front_seq;
        }
        if *cursor >= ring.next_seq {
            if ring.closed {
                return Err(Status::new(StatusCode::SocketClosed, "segment unlinked"));
            }
            return Ok(None);
        }
        let index = (*cursor - front_seq) as usize;
        let (_, payload) = &ring.frames[index];
        *cursor += 1;
        Ok(Some(payload.clone()))
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Role {
    Writer,
    Reader,
}

#[derive(Debug)]
struct ReaderState {
    cursor: u64,
    published: watch::Receiver<u64>,
}

#[derive(Debug)]
pub struct ShmChannel {
    segment: Arc<ShmSegment>,
    role: Role,
    send: Mutex<()>,
    recv: Mutex<ReaderState>,
    broken: AtomicBool,
    dynamic_recv: AtomicBool,
    recv_capacity: AtomicUsize,
}

impl ShmChannel {
    /// Attach to the named segment as a reader.
    pub fn connect(source: &ChannelSource, config: &ChannelConfig) -> Result<Self, Status> {
        let ChannelSource::Shm { segment, .. } = source else {
            return Err(Status::invalid_argument(format!(
                "expected a shm source, got {source}"
            )));
        };
        let segment = ShmSegment::attach(segment)?;
        Ok(Self::with_role(segment, Role::Reader, config))
    }

    fn with_role(segment: Arc<ShmSegment>, role: Role, config: &ChannelConfig) -> Self {
        let published = segment.published.subscribe();
        ShmChannel {
            segment,
            role,
            send: Mutex::new(()),
            recv: Mutex::new(ReaderState { cursor: 1, published }),
            broken: AtomicBool::new(false),
            dynamic_recv: AtomicBool::new(config.dynamic_receive_buffer),
            recv_capacity: AtomicUsize::new(config.receive_buffer_size),
        }
    }

    pub fn segment_name(&self) -> &str {
        self.segment.name()
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
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
        if matches!(self.role, Role::Reader) {
            return Err(Status::internal("shm readers cannot send"));
        }
        let _guard = self
            .send
            .try_lock()
            .map_err(|_| Status::new(StatusCode::WritingWhileSending, "send already in progress"))?;
        match self.segment.write(Arc::new(payload.to_vec())) {
            Ok(_seq) => Ok(()),
            Err(status) => {
                if status.code == StatusCode::SocketClosed {
                    self.broken.store(true, Ordering::Release);
                }
                Err(status)
            }
        }
    }

    pub async fn receive_message(&self) -> Result<Vec<u8>, Status> {
        if self.is_broken() {
            return Err(Status::new(StatusCode::SocketClosed, "channel is broken"));
        }
        let mut reader = self.recv.try_lock().map_err(|_| {
            Status::new(StatusCode::ReadingWhileReceiving, "receive already in progress")
        })?;

        loop {
            match self.segment.read_at(&mut reader.cursor) {
                Ok(Some(payload)) => {
                    let capacity = self.recv_capacity.load(Ordering::Acquire);
                    if payload.len() > capacity && !self.dynamic_recv.load(Ordering::Acquire) {
                        // Cursor already advanced; the oversized frame is
                        // skipped, matching datagram semantics.
                        return Err(
                            MessageIoError::NotEnoughBuffer { required: payload.len() }.into()
                        );
                    }
                    return Ok(payload.as_ref().clone());
                }
                Ok(None) => {
                    if reader.published.changed().await.is_err() {
                        self.broken.store(true, Ordering::Release);
                        return Err(Status::new(StatusCode::SocketClosed, "segment dropped"));
                    }
                }
                Err(status) => {
                    self.broken.store(true, Ordering::Release);
                    return Err(status);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Publisher-side handle: creates the segment and exposes the single
/// writer channel.  There is no per-reader accept — readers attach to the
/// segment directly and the one writer reaches all of them.
#[derive(Debug)]
pub struct ShmChannelListener {
    segment: Arc<ShmSegment>,
    size: u32,
}

impl ShmChannelListener {
    pub fn listen(requested: &ChannelSource) -> Result<Self, Status> {
        let ChannelSource::Shm { segment, size } = requested else {
            return Err(Status::invalid_argument(format!(
                "expected a shm source, got {requested}"
            )));
        };
        let segment = ShmSegment::create(segment, *size as usize)?;
        Ok(ShmChannelListener { segment, size: *size })
    }

    pub fn channel_source(&self) -> ChannelSource {
        ChannelSource::Shm {
            segment: self.segment.name().to_owned(),
            size: self.size,
        }
    }

    /// The standing writer channel for this segment.
    pub fn writer(&self, config: &ChannelConfig) -> ShmChannel {
        ShmChannel::with_role(self.segment.clone(), Role::Writer, config)
    }

    /// Remove the segment; attached readers observe `SocketClosed`.
    pub fn unlink(&self) {
        ShmSegment::unlink(self.segment.name());
    }
}

impl Drop for ShmChannelListener {
    fn drop(&mut self) {
        ShmSegment::unlink(self.segment.name());
    }
}
