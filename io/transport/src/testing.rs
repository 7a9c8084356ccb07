//! Helpers for driving a `TransportState` directly in unit tests.

use crate::args::{Role, TransportConfig};
use crate::barrier::Callback;
use crate::endpoint::{Endpoint, InlineScheduler};
use crate::stream::{Stream, StreamKey};
use crate::transport::TransportState;
use bytes::{Bytes, BytesMut};
use grpc::Metadata;
use http2::{FrameDecoder, FrameEncoder, HeaderField, HpackEncoder, StreamId};
use std::io;
use std::sync::{Arc, Weak};

struct NullEndpoint;

impl Endpoint for NullEndpoint {
    fn read(&self, _on_done: Callback<io::Result<Bytes>>) {}

    fn write(&self, _buffers: Vec<Bytes>, _on_done: Callback<io::Result<()>>) {}

    fn shutdown(&self) {}

    fn peer(&self) -> String {
        "test".to_string()
    }
}

/// A detached state: no combiner, no I/O. Deferred work piles up in
/// `deferred` until [`run_deferred`] is called.
pub fn state(role: Role) -> TransportState {
    state_with(role, |_| {})
}

/// [`state`] with BDP probing and keepalive off before `adjust` runs.
pub fn state_with(role: Role, adjust: impl FnOnce(&mut TransportConfig)) -> TransportState {
    let mut config = TransportConfig {
        bdp_probe: false,
        keepalive_time: None,
        ..TransportConfig::defaults(role)
    };
    adjust(&mut config);
    TransportState::new(
        Weak::new(),
        Arc::new(NullEndpoint),
        Arc::new(InlineScheduler),
        config,
        role,
    )
}

pub fn run_deferred(t: &mut TransportState) {
    for work in std::mem::take(&mut t.deferred) {
        work();
    }
}

/// Queue a client stream and let it take an id.
pub fn start_stream(t: &mut TransportState) -> StreamKey {
    let key = t.streams.insert(Stream::new());
    t.waiting_for_concurrency.push_back(key);
    t.maybe_start_some_streams();
    key
}

/// Builds the peer's side of the conversation.
pub struct Peer {
    pub frames: FrameEncoder,
    pub hpack: HpackEncoder,
    pub buf: BytesMut,
}

impl Peer {
    pub fn new() -> Self {
        Self {
            frames: FrameEncoder::new(),
            hpack: HpackEncoder::new(),
            buf: BytesMut::new(),
        }
    }

    pub fn headers(&mut self, id: u32, end_stream: bool, fields: &[(&str, &str)]) -> &mut Self {
        let fields: Vec<_> = fields
            .iter()
            .map(|(n, v)| HeaderField::new(n.as_bytes(), v.as_bytes()))
            .collect();
        let mut block = Vec::new();
        self.hpack.encode(&fields, &mut block);
        self.frames
            .write_headers(StreamId::new(id), end_stream, &block, &mut self.buf);
        self
    }

    pub fn message(&mut self, id: u32, end_stream: bool, payload: &[u8]) -> &mut Self {
        let mut framed = BytesMut::new();
        grpc::encode_message(payload, &mut framed);
        self.frames
            .write_data(StreamId::new(id), end_stream, &framed, &mut self.buf);
        self
    }

    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

/// Split a written batch into frames, skipping the client preface.
pub fn decode_frames(mut bytes: &[u8]) -> Vec<http2::Frame> {
    if let Some(rest) = bytes.strip_prefix(http2::CONNECTION_PREFACE) {
        bytes = rest;
    }
    let mut buf = BytesMut::from(bytes);
    let decoder = FrameDecoder::new();
    let mut frames = Vec::new();
    while let Ok(Some(frame)) = decoder.decode(&mut buf) {
        frames.push(frame);
    }
    frames
}

pub fn metadata(fields: &[(&str, &str)]) -> Metadata {
    let mut md = Metadata::new();
    for (k, v) in fields {
        md.insert(*k, *v);
    }
    md
}
