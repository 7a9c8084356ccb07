//! Per-RPC stream state and the arena that owns it.

use crate::barrier::{Callback, ClosureBarrier};
use crate::combiner::Deferred;
use crate::error::Error;
use bytes::{Bytes, BytesMut};
use grpc::{Code, MessageDecoder, Metadata};
use slab::Slab;
use std::collections::VecDeque;
use std::time::Instant;

pub type RecvInitialMetadata = Callback<Result<Metadata, Error>>;
/// `Ok(None)` marks the end of the message stream.
pub type RecvMessage = Callback<Result<Option<Bytes>, Error>>;
/// Trailing metadata always arrives; on failure it is synthesized from the
/// error and carries `grpc-status` and `grpc-message`.
pub type RecvTrailingMetadata = Callback<Metadata>;

/// Generation-checked index into the stream arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    index: usize,
    generation: u64,
}

pub struct Stream {
    generation: u64,
    /// Zero until assigned (client) or taken from the peer's HEADERS (server).
    pub id: u32,
    pub read_closed: bool,
    pub write_closed: bool,
    pub read_error: Option<Error>,
    pub write_error: Option<Error>,
    pub outgoing_window: i64,
    pub incoming_window: i64,
    pub in_stream_map: bool,
    /// An API handle still refers to this slot.
    pub api_held: bool,
    pub in_writable_list: bool,
    pub deadline: Option<Instant>,
    /// A non-OK `grpc-status` was received.
    pub seen_error: bool,

    pub send_initial_metadata: Option<Metadata>,
    pub send_initial_done: Option<ClosureBarrier>,
    pub sent_initial_metadata: bool,
    /// Framed messages not yet written.
    pub outgoing: BytesMut,
    /// Bytes ever queued to `outgoing`, and bytes ever written from it.
    pub queued_bytes: u64,
    pub flushed_bytes: u64,
    /// Message completions, each due once `flushed_bytes` reaches its mark.
    pub send_message_done: VecDeque<(u64, ClosureBarrier)>,
    pub send_trailing_metadata: Option<Metadata>,
    pub send_trailing_done: Option<ClosureBarrier>,
    pub sent_trailing_metadata: bool,

    pub received_initial_metadata: bool,
    pub recv_initial_metadata: Option<Metadata>,
    pub recv_initial_ready: Option<RecvInitialMetadata>,
    pub decoder: MessageDecoder,
    pub incoming_frames: VecDeque<Bytes>,
    pub recv_message_ready: Option<RecvMessage>,
    pub recv_trailing_metadata: Option<Metadata>,
    pub recv_trailing_ready: Option<RecvTrailingMetadata>,
}

impl Stream {
    pub fn new() -> Self {
        Self {
            generation: 0,
            id: 0,
            read_closed: false,
            write_closed: false,
            read_error: None,
            write_error: None,
            outgoing_window: 0,
            incoming_window: 0,
            in_stream_map: false,
            api_held: true,
            in_writable_list: false,
            deadline: None,
            seen_error: false,
            send_initial_metadata: None,
            send_initial_done: None,
            sent_initial_metadata: false,
            outgoing: BytesMut::new(),
            queued_bytes: 0,
            flushed_bytes: 0,
            send_message_done: VecDeque::new(),
            send_trailing_metadata: None,
            send_trailing_done: None,
            sent_trailing_metadata: false,
            received_initial_metadata: false,
            recv_initial_metadata: None,
            recv_initial_ready: None,
            decoder: MessageDecoder::default(),
            incoming_frames: VecDeque::new(),
            recv_message_ready: None,
            recv_trailing_metadata: None,
            recv_trailing_ready: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.read_closed && self.write_closed
    }

    /// Anything the writer could emit for this stream, flow control aside.
    pub fn has_pending_send(&self) -> bool {
        !self.write_closed
            && (self.send_initial_metadata.is_some()
                || !self.outgoing.is_empty()
                || self.send_trailing_metadata.is_some())
    }

    /// Queue one framed message. `done` completes once it is on the wire.
    pub fn queue_message(&mut self, message: &[u8], done: ClosureBarrier) {
        grpc::encode_message(message, &mut self.outgoing);
        self.queued_bytes += (grpc::HEADER_SIZE + message.len()) as u64;
        self.send_message_done.push_back((self.queued_bytes, done));
    }

    /// Record `n` bytes of `outgoing` as written; returns completions now due.
    pub fn note_flushed(&mut self, n: usize) -> Vec<ClosureBarrier> {
        self.flushed_bytes += n as u64;
        let mut due = Vec::new();
        while let Some((mark, _)) = self.send_message_done.front() {
            if *mark > self.flushed_bytes {
                break;
            }
            if let Some((_, barrier)) = self.send_message_done.pop_front() {
                due.push(barrier);
            }
        }
        due
    }

    /// Every send completion still pending, for failing on close.
    pub fn take_send_completions(&mut self) -> Vec<ClosureBarrier> {
        let mut out: Vec<_> = self.send_initial_done.take().into_iter().collect();
        out.extend(self.send_message_done.drain(..).map(|(_, b)| b));
        out.extend(self.send_trailing_done.take());
        self.send_initial_metadata = None;
        self.send_trailing_metadata = None;
        self.outgoing.clear();
        out
    }

    /// Hand whatever the receive side has to the callbacks waiting for it.
    pub fn poll_recv(&mut self) -> Vec<Deferred> {
        let mut out: Vec<Deferred> = Vec::new();

        if self.recv_initial_ready.is_some() {
            let result = match self.recv_initial_metadata.take() {
                Some(md) => Some(Ok(md)),
                None if self.read_closed => Some(Err(self.closed_error())),
                None => None,
            };
            if let Some(result) = result
                && let Some(cb) = self.recv_initial_ready.take()
            {
                out.push(Box::new(move || cb(result)));
            }
        }

        if self.recv_message_ready.is_some() && self.recv_initial_ready.is_none() {
            let result = match self.incoming_frames.pop_front() {
                Some(msg) => Some(Ok(Some(msg))),
                None if self.read_closed => Some(match &self.read_error {
                    Some(e) => Err(e.clone()),
                    None => Ok(None),
                }),
                None => None,
            };
            if let Some(result) = result
                && let Some(cb) = self.recv_message_ready.take()
            {
                out.push(Box::new(move || cb(result)));
            }
        }

        if self.recv_trailing_ready.is_some()
            && self.read_closed
            && self.incoming_frames.is_empty()
        {
            let md = self.recv_trailing_metadata.take().unwrap_or_default();
            if let Some(cb) = self.recv_trailing_ready.take() {
                out.push(Box::new(move || cb(md)));
            }
        }
        out
    }

    fn closed_error(&self) -> Error {
        self.read_error.clone().unwrap_or_else(|| {
            Error::new("Stream closed before metadata arrived").with_code(Code::Internal)
        })
    }
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

/// Trailing metadata describing `error` as a gRPC status.
pub fn synthesize_trailers(error: &Error, deadline: Option<Instant>) -> Metadata {
    let (code, message) = error.status(deadline);
    let mut md = Metadata::new();
    md.insert("grpc-status", code.as_u32().to_string());
    md.insert("grpc-message", message);
    md
}

/// Slot arena. A slot index is reused only with a new generation, so stale
/// keys are rejected instead of reaching another stream.
#[derive(Default)]
pub struct Streams {
    slab: Slab<Stream>,
    next_generation: u64,
}

impl Streams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mut stream: Stream) -> StreamKey {
        let generation = self.next_generation;
        self.next_generation += 1;
        stream.generation = generation;
        let index = self.slab.insert(stream);
        StreamKey { index, generation }
    }

    pub fn get(&self, key: StreamKey) -> Option<&Stream> {
        self.slab
            .get(key.index)
            .filter(|s| s.generation == key.generation)
    }

    pub fn get_mut(&mut self, key: StreamKey) -> Option<&mut Stream> {
        self.slab
            .get_mut(key.index)
            .filter(|s| s.generation == key.generation)
    }

    pub fn remove(&mut self, key: StreamKey) -> Option<Stream> {
        self.get(key)?;
        Some(self.slab.remove(key.index))
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn keys(&self) -> Vec<StreamKey> {
        self.slab
            .iter()
            .map(|(index, s)| StreamKey {
                index,
                generation: s.generation,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_stale_key_rejected() {
        let mut streams = Streams::new();
        let a = streams.insert(Stream::new());
        streams.remove(a).unwrap();
        let b = streams.insert(Stream::new());
        assert_eq!(a.index, b.index);
        assert!(streams.get(a).is_none());
        assert!(streams.get(b).is_some());
        assert!(streams.remove(a).is_none());
        assert_eq!(streams.len(), 1);
    }

    #[test]
    fn test_message_completion_after_flush() {
        let mut stream = Stream::new();
        let done = ClosureBarrier::noop();
        stream.queue_message(b"hello", done);
        assert_eq!(stream.outgoing.len(), 10);
        assert!(stream.note_flushed(9).is_empty());
        assert_eq!(stream.note_flushed(1).len(), 1);
    }

    #[test]
    fn test_recv_order() {
        let got = Arc::new(Mutex::new(Vec::new()));
        let mut stream = Stream::new();

        let g = got.clone();
        stream.recv_message_ready = Some(Box::new(move |r: Result<Option<Bytes>, Error>| {
            g.lock().push(format!("msg {:?}", r.map(|m| m.map(|b| b.len()))))
        }));
        let g = got.clone();
        stream.recv_initial_ready = Some(Box::new(move |r: Result<Metadata, Error>| {
            g.lock().push(format!("initial {}", r.is_ok()))
        }));

        // Nothing to deliver yet.
        assert!(stream.poll_recv().is_empty());

        stream.recv_initial_metadata = Some(Metadata::new());
        stream.incoming_frames.push_back(Bytes::from_static(b"abc"));
        let effects = stream.poll_recv();
        assert_eq!(effects.len(), 2);
        for e in effects {
            e();
        }
        assert_eq!(*got.lock(), ["initial true", "msg Ok(Some(3))"]);
    }

    #[test]
    fn test_trailers_after_messages_drained() {
        let mut stream = Stream::new();
        stream.read_closed = true;
        stream.incoming_frames.push_back(Bytes::from_static(b"x"));
        stream.recv_trailing_ready = Some(Box::new(|_| {}));
        assert!(stream.poll_recv().is_empty());
        stream.incoming_frames.clear();
        assert_eq!(stream.poll_recv().len(), 1);
    }

    #[test]
    fn test_synthesized_trailers() {
        let err = Error::new("Deadline Exceeded").with_code(Code::DeadlineExceeded);
        let md = synthesize_trailers(&err, None);
        assert_eq!(md.get("grpc-status"), Some("4"));
        assert_eq!(md.get("grpc-message"), Some("Deadline Exceeded"));
    }
}
