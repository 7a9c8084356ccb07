#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use grpc::Metadata;
use http2::{
    CONNECTION_PREFACE, Frame, FrameDecoder, FrameEncoder, HeaderField, HpackDecoder,
    HpackEncoder, Setting, StreamId,
};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use transport::{
    Callback, ChannelArgs, Endpoint, Error, Role, Scheduler, StreamOp, Task, Transport,
    args,
};

/// Endpoint that records writes and hands reads over on demand.
#[derive(Default)]
pub struct MockEndpoint {
    written: Mutex<BytesMut>,
    pending_read: Mutex<Option<Callback<io::Result<Bytes>>>>,
    shutdown: AtomicBool,
}

impl MockEndpoint {
    /// Complete the outstanding read with `data`.
    pub fn deliver(&self, data: Bytes) {
        let cb = self.pending_read.lock().take();
        let cb = cb.expect("no read outstanding");
        cb(Ok(data));
    }

    pub fn take_written(&self) -> Bytes {
        self.written.lock().split().freeze()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl Endpoint for MockEndpoint {
    fn read(&self, on_done: Callback<io::Result<Bytes>>) {
        *self.pending_read.lock() = Some(on_done);
    }

    fn write(&self, buffers: Vec<Bytes>, on_done: Callback<io::Result<()>>) {
        {
            let mut written = self.written.lock();
            for b in buffers {
                written.extend_from_slice(&b);
            }
        }
        on_done(Ok(()));
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let cb = self.pending_read.lock().take();
        if let Some(cb) = cb {
            cb(Err(io::Error::new(io::ErrorKind::ConnectionAborted, "shutdown")));
        }
    }

    fn peer(&self) -> String {
        "ipv4:127.0.0.1:50051".to_string()
    }
}

/// Runs deferred work inline and keeps timers until fired by hand.
#[derive(Default)]
pub struct ManualScheduler {
    timers: Mutex<Vec<(Instant, Task)>>,
}

impl ManualScheduler {
    pub fn fire_timers(&self) {
        let timers = std::mem::take(&mut *self.timers.lock());
        for (_, task) in timers {
            task();
        }
    }

    pub fn timer_count(&self) -> usize {
        self.timers.lock().len()
    }
}

impl Scheduler for ManualScheduler {
    fn run_later(&self, task: Task) {
        task();
    }

    fn run_at(&self, deadline: Instant, task: Task) {
        self.timers.lock().push((deadline, task));
    }
}

pub struct Harness {
    pub transport: Transport,
    pub endpoint: Arc<MockEndpoint>,
    pub scheduler: Arc<ManualScheduler>,
    pub peer: PeerCodec,
}

impl Harness {
    pub fn new(role: Role, extra: &[(&str, i64)]) -> Self {
        transport::logging::init_for_tests();
        let mut channel_args = ChannelArgs::new()
            .set(args::BDP_PROBE, 0i64)
            .set(args::KEEPALIVE_TIME_MS, args::INFINITE_MS);
        for (k, v) in extra {
            channel_args = channel_args.set(*k, *v);
        }
        let endpoint = Arc::new(MockEndpoint::default());
        let scheduler = Arc::new(ManualScheduler::default());
        let transport = Transport::new(endpoint.clone(), scheduler.clone(), &channel_args, role);
        transport.start_reading(None);
        Self {
            transport,
            endpoint,
            scheduler,
            peer: PeerCodec::new(),
        }
    }

    /// Frames written since the last call.
    pub fn written_frames(&mut self) -> Vec<Frame> {
        let bytes = self.endpoint.take_written();
        self.peer.decode(&bytes)
    }

    pub fn deliver(&self, bytes: Bytes) {
        self.endpoint.deliver(bytes);
    }
}

/// The remote side's framing and HPACK state.
pub struct PeerCodec {
    pub frames: FrameEncoder,
    encoder: HpackEncoder,
    decoder: HpackDecoder,
    pub buf: BytesMut,
}

impl PeerCodec {
    pub fn new() -> Self {
        Self {
            frames: FrameEncoder::new(),
            encoder: HpackEncoder::new(),
            decoder: HpackDecoder::new(),
            buf: BytesMut::new(),
        }
    }

    pub fn preface(&mut self) -> &mut Self {
        self.buf.extend_from_slice(CONNECTION_PREFACE);
        self
    }

    pub fn settings(&mut self, settings: &[Setting]) -> &mut Self {
        self.frames.write_settings(settings, &mut self.buf);
        self
    }

    pub fn settings_ack(&mut self) -> &mut Self {
        self.frames.write_settings_ack(&mut self.buf);
        self
    }

    pub fn headers(&mut self, id: u32, end_stream: bool, fields: &[(&str, &str)]) -> &mut Self {
        let fields: Vec<_> = fields
            .iter()
            .map(|(n, v)| HeaderField::new(n.as_bytes(), v.as_bytes()))
            .collect();
        let mut block = Vec::new();
        self.encoder.encode(&fields, &mut block);
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

    pub fn window_update(&mut self, id: u32, increment: u32) -> &mut Self {
        self.frames
            .write_window_update(StreamId::new(id), increment, &mut self.buf);
        self
    }

    pub fn rst_stream(&mut self, id: u32, code: http2::ErrorCode) -> &mut Self {
        self.frames
            .write_rst_stream(StreamId::new(id), code.to_u32(), &mut self.buf);
        self
    }

    pub fn goaway(&mut self, last_stream_id: u32, code: http2::ErrorCode) -> &mut Self {
        self.frames
            .write_goaway(StreamId::new(last_stream_id), code.to_u32(), b"", &mut self.buf);
        self
    }

    pub fn ping(&mut self, ack: bool, data: [u8; 8]) -> &mut Self {
        self.frames.write_ping(ack, data, &mut self.buf);
        self
    }

    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn decode(&mut self, mut bytes: &[u8]) -> Vec<Frame> {
        if let Some(rest) = bytes.strip_prefix(CONNECTION_PREFACE) {
            bytes = rest;
        }
        let mut buf = BytesMut::from(bytes);
        let decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf).expect("valid frames") {
            frames.push(frame);
        }
        frames
    }

    /// Decode a header block written by the transport under test.
    pub fn header_block(&mut self, block: &[u8]) -> Metadata {
        let fields = self.decoder.decode(block).expect("valid hpack");
        Metadata::from_header_fields(fields).expect("utf-8 headers")
    }
}

/// What a stream's receive callbacks have seen.
#[derive(Default)]
pub struct Received {
    pub initial: Option<Result<Metadata, Error>>,
    pub messages: Vec<Bytes>,
    pub message_error: Option<Error>,
    pub end_of_messages: bool,
    pub trailing: Option<Metadata>,
    pub completed: Vec<Result<(), Error>>,
}

pub type Shared = Arc<Mutex<Received>>;

pub fn recv_initial(op: &mut StreamOp, rx: &Shared) {
    let rx = rx.clone();
    op.recv_initial_metadata = Some(Box::new(move |r: Result<Metadata, Error>| {
        rx.lock().initial = Some(r)
    }));
}

pub fn recv_message(op: &mut StreamOp, rx: &Shared) {
    let rx = rx.clone();
    op.recv_message = Some(Box::new(move |r: Result<Option<Bytes>, Error>| {
        let mut rx = rx.lock();
        match r {
            Ok(Some(message)) => rx.messages.push(message),
            Ok(None) => rx.end_of_messages = true,
            Err(e) => rx.message_error = Some(e),
        }
    }));
}

pub fn recv_trailing(op: &mut StreamOp, rx: &Shared) {
    let rx = rx.clone();
    op.recv_trailing_metadata = Some(Box::new(move |md: Metadata| rx.lock().trailing = Some(md)));
}

pub fn on_complete(op: &mut StreamOp, rx: &Shared) {
    let rx = rx.clone();
    op.on_complete = Some(Box::new(move |r: Result<(), Error>| rx.lock().completed.push(r)));
}

pub fn metadata(fields: &[(&str, &str)]) -> Metadata {
    let mut md = Metadata::new();
    for (k, v) in fields {
        md.insert(*k, *v);
    }
    md
}

pub fn request_headers() -> Metadata {
    metadata(&[
        (":method", "POST"),
        (":scheme", "http"),
        (":path", "/echo.Echo/Say"),
        (":authority", "localhost"),
        ("content-type", "application/grpc"),
        ("te", "trailers"),
    ])
}
