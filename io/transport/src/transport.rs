//! Per-connection state and the operations that run under its combiner.
//!
//! Everything here executes as a combiner action: exactly one thread touches
//! a `TransportState` at a time, and anything that calls out (endpoint I/O,
//! application callbacks, the scheduler) is pushed onto `deferred` and runs
//! after the state lock is released.

use crate::api::{AcceptStream, Shared, StreamOp, TransportOp};
use crate::args::{Role, TransportConfig};
use crate::barrier::ClosureBarrier;
use crate::combiner::{Actor, Deferred};
use crate::connectivity::{ConnectivityState, ConnectivityTracker, Notification};
use crate::endpoint::{Endpoint, Scheduler};
use crate::error::Error;
use crate::flow_control::{self, TransportFlowControl};
use crate::keepalive::Keepalive;
use crate::parser::{DeframeState, HeaderBlock};
use crate::ping::{PingPurpose, Pings};
use crate::settings::{SettingKind, Settings};
use crate::stream::{Stream, StreamKey, Streams, synthesize_trailers};
use bytes::{Bytes, BytesMut};
use grpc::Code;
use http2::hpack::literal;
use http2::{
    ErrorCode, FrameDecoder, FrameEncoder, HpackDecoder, HpackEncoder, MAX_WINDOW_SIZE, StreamId,
};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, error, trace};

/// Largest stream id either side may use.
pub const MAX_STREAM_ID: u32 = MAX_WINDOW_SIZE;

/// Whether a batched write is wanted, scheduled or in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Inactive,
    /// Write on lock release, inline.
    RequestedNoPoller,
    /// Write on lock release, after a hop through the scheduler.
    RequestedWithPoller,
    /// The hop is pending.
    Scheduled,
    Writing,
    /// More was requested while writing.
    WritingStaleNoPoller,
    WritingStaleWithPoller,
}

impl WriteState {
    /// Transition for a write request. `covered_by_poller` is true when the
    /// request comes from an API call whose caller keeps driving progress.
    pub fn on_initiate(self, covered_by_poller: bool) -> Self {
        use WriteState::*;
        match (self, covered_by_poller) {
            (Inactive, false) => RequestedNoPoller,
            (Inactive, true) => RequestedWithPoller,
            (RequestedNoPoller, true) => RequestedWithPoller,
            (Writing, false) => WritingStaleNoPoller,
            (Writing, true) => WritingStaleWithPoller,
            (WritingStaleNoPoller, true) => WritingStaleWithPoller,
            (state, _) => state,
        }
    }

    /// State once the in-flight write has completed.
    pub fn on_write_done(self) -> Self {
        use WriteState::*;
        match self {
            WritingStaleNoPoller => RequestedNoPoller,
            WritingStaleWithPoller => RequestedWithPoller,
            _ => Inactive,
        }
    }
}

/// GOAWAY queued for the next write.
pub(crate) struct PendingGoaway {
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
    /// Close the connection with this once the GOAWAY is on the wire.
    pub then_close: Option<Error>,
}

/// Run `f` under the transport's combiner, if the transport still exists.
pub(crate) fn enqueue(
    weak: &Weak<Shared>,
    f: impl FnOnce(&mut TransportState) + Send + 'static,
) {
    if let Some(shared) = weak.upgrade() {
        shared.combiner.run(Box::new(f));
    }
}

pub(crate) struct TransportState {
    pub this: Weak<Shared>,
    pub role: Role,
    pub peer: String,
    pub endpoint: Arc<dyn Endpoint>,
    pub scheduler: Arc<dyn Scheduler>,
    pub config: TransportConfig,

    pub streams: Streams,
    /// Streams with a wire id, by id.
    pub stream_table: BTreeMap<u32, StreamKey>,
    /// Client streams waiting for an id and a concurrency slot.
    pub waiting_for_concurrency: VecDeque<StreamKey>,
    pub writable: VecDeque<StreamKey>,
    /// Streams with data blocked only by the connection window.
    pub stalled_by_transport: VecDeque<StreamKey>,
    pub next_stream_id: u32,
    pub last_incoming_stream_id: u32,

    pub settings: Settings,
    pub settings_acks_owed: usize,
    pub flow: TransportFlowControl,
    pub pings: Pings,
    pub keepalive: Keepalive,
    pub hpack_encoder: HpackEncoder,
    pub hpack_decoder: HpackDecoder,
    pub frame_encoder: FrameEncoder,
    pub frame_decoder: FrameDecoder,

    pub write_state: WriteState,
    /// Frames queued outside the per-stream writer (RST_STREAM, WINDOW_UPDATE,
    /// status blocks).
    pub qbuf: BytesMut,
    pub sent_preface: bool,
    pub pending_goaway: Option<PendingGoaway>,
    pub goaway_sent: bool,
    pub goaway_received: Option<u32>,
    pub close_after_write: Option<Error>,
    pub closed: Option<Error>,
    /// Holds that keep the endpoint open: one from a write request until
    /// the write state returns to inactive.
    pub endpoint_refs: usize,
    pub endpoint_shutdown: bool,
    pub connectivity: ConnectivityTracker,
    pub accept_stream: Option<AcceptStream>,

    pub deframe: DeframeState,
    pub read_buf: BytesMut,
    pub header_block: Option<HeaderBlock>,
    pub is_parsing: bool,
    pub pending_removals: Vec<StreamKey>,
    pub reading: bool,

    /// Completions due when the in-flight write finishes.
    pub write_completions: Vec<ClosureBarrier>,
    pub deferred: Vec<Deferred>,
}

impl Actor for TransportState {
    fn quiesce(&mut self) -> Vec<Deferred> {
        loop {
            match self.write_state {
                WriteState::RequestedWithPoller => {
                    self.write_state = WriteState::Scheduled;
                    let weak = self.this.clone();
                    let scheduler = self.scheduler.clone();
                    self.deferred.push(Box::new(move || {
                        scheduler.run_later(Box::new(move || enqueue(&weak, |t| t.start_writing())));
                    }));
                    break;
                }
                WriteState::RequestedNoPoller => self.start_writing(),
                _ => break,
            }
        }
        self.maybe_shutdown_endpoint();
        std::mem::take(&mut self.deferred)
    }
}

impl TransportState {
    pub fn new(
        this: Weak<Shared>,
        endpoint: Arc<dyn Endpoint>,
        scheduler: Arc<dyn Scheduler>,
        config: TransportConfig,
        role: Role,
    ) -> Self {
        let mut settings = Settings::new();
        if role.is_client() {
            settings.push(SettingKind::EnablePush, 0);
        }
        settings.push(SettingKind::HeaderTableSize, config.decoder_table_size);
        if let Some(max) = config.max_concurrent_streams {
            settings.push(SettingKind::MaxConcurrentStreams, max);
        }
        settings.push(SettingKind::InitialWindowSize, config.initial_window_size);
        settings.push(SettingKind::MaxHeaderListSize, config.max_metadata_size);

        let peer = endpoint.peer();
        debug!(peer = %peer, ?role, "transport created");
        Self {
            this,
            role,
            peer,
            endpoint,
            scheduler,
            streams: Streams::new(),
            stream_table: BTreeMap::new(),
            waiting_for_concurrency: VecDeque::new(),
            writable: VecDeque::new(),
            stalled_by_transport: VecDeque::new(),
            next_stream_id: config.initial_stream_id,
            last_incoming_stream_id: 0,
            settings,
            settings_acks_owed: 0,
            flow: TransportFlowControl::new(config.lookahead_bytes, config.bdp_probe, Instant::now()),
            pings: Pings::new(config.ping_policy),
            keepalive: Keepalive::new(config.keepalive_time),
            hpack_encoder: HpackEncoder::with_table_size(config.encoder_table_size as usize),
            hpack_decoder: HpackDecoder::new(),
            frame_encoder: FrameEncoder::new(),
            frame_decoder: FrameDecoder::new(),
            write_state: WriteState::Inactive,
            qbuf: BytesMut::new(),
            sent_preface: !role.is_client(),
            pending_goaway: None,
            goaway_sent: false,
            goaway_received: None,
            close_after_write: None,
            closed: None,
            endpoint_refs: 0,
            endpoint_shutdown: false,
            connectivity: ConnectivityTracker::new(ConnectivityState::Ready),
            accept_stream: None,
            deframe: if role.is_client() {
                DeframeState::AwaitingHeader
            } else {
                DeframeState::ClientPreface(0)
            },
            read_buf: BytesMut::new(),
            header_block: None,
            is_parsing: false,
            pending_removals: Vec::new(),
            reading: false,
            write_completions: Vec::new(),
            deferred: Vec::new(),
            config,
        }
    }

    pub fn defer(&mut self, work: impl FnOnce() + Send + 'static) {
        self.deferred.push(Box::new(work));
    }

    pub fn complete(&mut self, barrier: ClosureBarrier, result: Result<(), Error>) {
        self.defer(move || barrier.complete(result));
    }

    fn notify(&mut self, notifications: Vec<Notification>) {
        for (watcher, state) in notifications {
            self.defer(move || watcher(state));
        }
    }

    pub fn set_connectivity(&mut self, state: ConnectivityState, reason: &str) {
        let fired = self.connectivity.set(state, reason);
        self.notify(fired);
    }

    // Write state machine.

    pub fn initiate_write(&mut self, covered_by_poller: bool, reason: &'static str) {
        if self.write_state == WriteState::Inactive {
            self.endpoint_refs += 1;
        }
        let next = self.write_state.on_initiate(covered_by_poller);
        trace!(reason, from = ?self.write_state, to = ?next, "initiate write");
        self.write_state = next;
    }

    pub fn start_writing(&mut self) {
        if !matches!(
            self.write_state,
            WriteState::Scheduled | WriteState::RequestedNoPoller
        ) {
            return;
        }
        // Requests made while the batch is built mark it stale.
        self.write_state = WriteState::Writing;
        let batch = if self.unlocking_check_writes() {
            self.begin_write()
        } else {
            None
        };
        let Some(buffers) = batch else {
            self.write_state = self.write_state.on_write_done();
            if self.write_state == WriteState::Inactive {
                self.endpoint_refs = self.endpoint_refs.saturating_sub(1);
            }
            return;
        };
        trace!(bytes = buffers.iter().map(Bytes::len).sum::<usize>(), "writing");
        let endpoint = self.endpoint.clone();
        let weak = self.this.clone();
        self.defer(move || {
            endpoint.write(
                buffers,
                Box::new(move |result| enqueue(&weak, move |t| t.write_done(result))),
            );
        });
    }

    fn write_done(&mut self, result: io::Result<()>) {
        let completions = std::mem::take(&mut self.write_completions);
        let result = result.map_err(|e| {
            Error::new(format!("Write failed: {}", e)).with_code(Code::Unavailable)
        });
        for barrier in completions {
            self.complete(barrier, result.clone());
        }
        if let Err(error) = result {
            self.drop_connection(error);
        }
        if let Some(error) = self.close_after_write.take() {
            self.drop_connection(error);
        }
        self.write_state = self.write_state.on_write_done();
        if self.write_state == WriteState::Inactive {
            self.endpoint_refs = self.endpoint_refs.saturating_sub(1);
        }
    }

    fn maybe_shutdown_endpoint(&mut self) {
        if self.closed.is_some() && self.endpoint_refs == 0 && !self.endpoint_shutdown {
            self.endpoint_shutdown = true;
            let endpoint = self.endpoint.clone();
            debug!(peer = %self.peer, "shutting down endpoint");
            self.defer(move || endpoint.shutdown());
        }
    }

    // Reading.

    pub fn start_reading(&mut self, initial: Option<Bytes>) {
        if let Some(data) = initial
            && !data.is_empty()
        {
            self.perform_read(data);
        }
        self.continue_read();
    }

    fn continue_read(&mut self) {
        if self.closed.is_some() || self.reading {
            return;
        }
        self.reading = true;
        let endpoint = self.endpoint.clone();
        let weak = self.this.clone();
        self.defer(move || {
            endpoint.read(Box::new(move |result| {
                enqueue(&weak, move |t| t.read_done(result))
            }));
        });
    }

    fn read_done(&mut self, result: io::Result<Bytes>) {
        self.reading = false;
        match result {
            Err(e) => self.drop_connection(
                Error::new(format!("Endpoint read failed: {}", e)).with_code(Code::Unavailable),
            ),
            Ok(data) if data.is_empty() => self.drop_connection(
                Error::new("Endpoint read failed: connection closed").with_code(Code::Unavailable),
            ),
            Ok(data) => {
                self.perform_read(data);
                self.continue_read();
            }
        }
    }

    // Connection teardown.

    /// Close the connection: every stream fails with `error`, connectivity
    /// becomes SHUTDOWN and the endpoint is shut down once no write holds it.
    pub fn drop_connection(&mut self, error: Error) {
        if self.closed.is_some() {
            return;
        }
        error!(peer = %self.peer, %error, streams = self.streams.len(), "closing transport");
        self.closed = Some(error.clone());
        self.set_connectivity(ConnectivityState::Shutdown, "transport closed");
        self.keepalive.on_close();

        for key in self.streams.keys() {
            self.mark_stream_closed(key, true, true, Some(error.clone()));
        }
        for purpose in self.pings.drain() {
            if let PingPurpose::User(cb) = purpose {
                let error = error.clone();
                self.defer(move || cb(Err(error)));
            }
        }
        self.writable.clear();
        self.stalled_by_transport.clear();
        // The callback often holds the transport itself.
        self.accept_stream = None;
    }

    /// Queue a GOAWAY carrying `error`. Streams the peer opens afterwards
    /// are refused.
    pub fn send_goaway(&mut self, error: Error) {
        if self.goaway_sent || self.closed.is_some() {
            return;
        }
        debug!(peer = %self.peer, %error, last_stream_id = self.last_incoming_stream_id, "sending GOAWAY");
        self.goaway_sent = true;
        self.pending_goaway = Some(PendingGoaway {
            error_code: error.http2_error(),
            debug_data: Bytes::from(error.message().to_string()),
            then_close: None,
        });
        self.initiate_write(true, "goaway_sent");
    }

    /// Send `goaway`, then close with `close` once it has been written.
    pub fn goaway_and_close(&mut self, goaway: Error, close: Error) {
        self.send_goaway(goaway);
        match &mut self.pending_goaway {
            Some(pending) => pending.then_close = Some(close),
            None => self.drop_connection(close),
        }
    }

    // Stream lifecycle.

    pub fn mark_writable(&mut self, key: StreamKey) {
        if let Some(s) = self.streams.get_mut(key)
            && s.in_stream_map
            && !s.in_writable_list
        {
            s.in_writable_list = true;
            self.writable.push_back(key);
        }
    }

    /// Give queued client streams ids while the peer's concurrency limit
    /// allows. Once ids run out the transport goes to TRANSIENT_FAILURE and
    /// every queued stream fails with UNAVAILABLE.
    pub fn maybe_start_some_streams(&mut self) {
        let max_concurrent = self.settings.peer(SettingKind::MaxConcurrentStreams) as usize;
        while self.next_stream_id <= MAX_STREAM_ID
            && self.stream_table.len() < max_concurrent
            && self.goaway_received.is_none()
            && self.closed.is_none()
        {
            let Some(key) = self.waiting_for_concurrency.pop_front() else {
                break;
            };
            let outgoing = self.settings.peer(SettingKind::InitialWindowSize) as i64;
            let incoming = self
                .settings
                .sent(SettingKind::InitialWindowSize)
                .max(self.settings.acked(SettingKind::InitialWindowSize))
                as i64;
            let Some(s) = self.streams.get_mut(key) else {
                continue;
            };
            if s.is_closed() {
                continue;
            }
            let id = self.next_stream_id;
            self.next_stream_id += 2;
            s.id = id;
            s.outgoing_window = outgoing;
            s.incoming_window = incoming;
            s.in_stream_map = true;
            self.stream_table.insert(id, key);
            debug!(id, "starting stream");
            self.mark_writable(key);
            self.initiate_write(true, "start_new_stream");
        }

        if self.goaway_received.is_some() && !self.waiting_for_concurrency.is_empty() {
            let queued: Vec<_> = self.waiting_for_concurrency.drain(..).collect();
            for key in queued {
                self.mark_stream_closed(
                    key,
                    true,
                    true,
                    Some(
                        Error::new("GOAWAY received")
                            .with_code(Code::Unavailable)
                            .with_transparent_retry(),
                    ),
                );
            }
        }

        if self.role.is_client() && self.next_stream_id > MAX_STREAM_ID {
            self.set_connectivity(ConnectivityState::TransientFailure, "Stream IDs exhausted");
            let queued: Vec<_> = self.waiting_for_concurrency.drain(..).collect();
            for key in queued {
                self.mark_stream_closed(
                    key,
                    true,
                    true,
                    Some(Error::new("Stream IDs exhausted").with_code(Code::Unavailable)),
                );
            }
        }
    }

    /// Close one or both directions of a stream. Once both are closed the
    /// stream leaves the table, unless a parse is walking it, in which case
    /// removal waits until the parse ends.
    pub fn mark_stream_closed(
        &mut self,
        key: StreamKey,
        close_reads: bool,
        close_writes: bool,
        error: Option<Error>,
    ) {
        let Some(s) = self.streams.get_mut(key) else {
            return;
        };
        if s.is_closed() {
            return;
        }
        let mut failed = Vec::new();
        if close_reads && !s.read_closed {
            s.read_closed = true;
            if let Some(e) = &error {
                s.incoming_frames.clear();
                if s.recv_trailing_metadata.is_none() {
                    s.recv_trailing_metadata = Some(synthesize_trailers(e, s.deadline));
                }
            }
            s.read_error = error.clone();
        }
        if close_writes && !s.write_closed {
            s.write_closed = true;
            s.write_error = error.clone();
            let e = error.clone().unwrap_or_else(|| {
                Error::new("Attempt to send on a closed stream").with_code(Code::Unavailable)
            });
            for barrier in s.take_send_completions() {
                failed.push((barrier, e.clone()));
            }
        }
        let effects = s.poll_recv();
        let closed = s.is_closed();
        trace!(id = s.id, read = s.read_closed, write = s.write_closed, "stream close");

        for (barrier, e) in failed {
            self.complete(barrier, Err(e));
        }
        self.deferred.extend(effects);
        if closed {
            if self.is_parsing {
                self.pending_removals.push(key);
            } else {
                self.remove_stream(key);
            }
        }
    }

    pub fn remove_stream(&mut self, key: StreamKey) {
        let Some(s) = self.streams.get_mut(key) else {
            return;
        };
        let left_table = s.in_stream_map;
        if left_table {
            s.in_stream_map = false;
            self.stream_table.remove(&s.id);
            debug!(id = s.id, remaining = self.stream_table.len(), "stream removed");
        }
        let free = !s.api_held;
        self.waiting_for_concurrency.retain(|k| *k != key);
        if free {
            self.streams.remove(key);
        }
        if left_table {
            self.maybe_start_some_streams();
        }
    }

    /// Cancel a stream with `error`: a RST_STREAM goes out if the peer knows
    /// the stream (preceded by a status block on a server that has not sent
    /// trailers) and both directions close.
    pub fn cancel_from_api(&mut self, key: StreamKey, error: Error) {
        let Some(s) = self.streams.get_mut(key) else {
            return;
        };
        if s.is_closed() {
            return;
        }
        let (code, message) = error.status(s.deadline);
        debug!(id = s.id, ?code, %message, "cancelling stream");

        let peer_knows = s.in_stream_map && (self.role == Role::Server || s.sent_initial_metadata);
        if peer_knows {
            let id = StreamId::new(s.id);
            if self.role == Role::Server && !s.sent_trailing_metadata {
                let mut block = Vec::new();
                self.hpack_encoder.flush_size_update(&mut block);
                let inserted = literal::encode_status_block(
                    !s.sent_initial_metadata,
                    code.as_u32(),
                    &message,
                    &mut block,
                );
                for field in inserted {
                    self.hpack_encoder.note_inserted(field);
                }
                self.frame_encoder.write_headers(id, true, &block, &mut self.qbuf);
                s.sent_initial_metadata = true;
                s.sent_trailing_metadata = true;
            }
            self.frame_encoder
                .write_rst_stream(id, error.http2_error().to_u32(), &mut self.qbuf);
            self.initiate_write(false, "rst_stream");
        }
        self.waiting_for_concurrency.retain(|k| *k != key);
        self.mark_stream_closed(key, true, true, Some(error));
    }

    pub fn arm_deadline(&mut self, key: StreamKey, deadline: Instant) {
        let weak = self.this.clone();
        let scheduler = self.scheduler.clone();
        self.defer(move || {
            scheduler.run_at(
                deadline,
                Box::new(move || enqueue(&weak, move |t| t.deadline_expired(key))),
            );
        });
    }

    fn deadline_expired(&mut self, key: StreamKey) {
        if self.streams.get(key).is_some_and(|s| !s.is_closed()) {
            self.cancel_from_api(
                key,
                Error::new("Deadline Exceeded").with_code(Code::DeadlineExceeded),
            );
        }
    }

    /// WINDOW_UPDATE for a stream whose reader is waiting and whose window
    /// has run low.
    pub fn maybe_stream_window_update(&mut self, key: StreamKey) {
        let target = self.settings.sent(SettingKind::InitialWindowSize) as i64;
        let Some(s) = self.streams.get_mut(key) else {
            return;
        };
        if !s.in_stream_map || s.read_closed || s.recv_message_ready.is_none() {
            return;
        }
        if let Some(increment) = flow_control::update_due(s.incoming_window, target) {
            s.incoming_window = flow_control::clamp_window(s.incoming_window + increment as i64);
            self.frame_encoder
                .write_window_update(StreamId::new(s.id), increment, &mut self.qbuf);
            self.initiate_write(false, "stream_flow_control");
        }
    }

    pub fn maybe_connection_window_update(&mut self) {
        if let Some(increment) = self.flow.take_connection_update() {
            self.frame_encoder
                .write_window_update(StreamId::CONNECTION, increment, &mut self.qbuf);
            self.initiate_write(false, "transport_flow_control");
        }
    }

    pub fn maybe_bdp_ping(&mut self) {
        if self.flow.bdp_need_ping(Instant::now()) {
            self.flow.bdp_schedule_ping();
            self.pings.queue(PingPurpose::Bdp);
            self.initiate_write(false, "bdp_ping");
        }
    }

    // API operations.

    pub fn perform_stream_op(&mut self, key: StreamKey, op: StreamOp) {
        let barrier = match op.on_complete {
            Some(cb) => ClosureBarrier::new(cb),
            None => ClosureBarrier::noop(),
        };
        if self.streams.get(key).is_none() {
            let error = Error::new("Stream was destroyed").with_code(Code::Internal);
            fail_op_callbacks(self, op.recv_initial_metadata, op.recv_message, op.recv_trailing_metadata, &error);
            self.complete(barrier, Err(error));
            return;
        }

        if let Some(error) = op.cancel {
            self.cancel_from_api(key, error);
        }

        let client = self.role.is_client();
        let closed_error = self.closed.clone();
        let mut results: Vec<(ClosureBarrier, Result<(), Error>)> = Vec::new();
        let mut queue_for_id = false;
        let mut writable = false;
        let mut deadline = None;
        // A receive slot that is already waiting keeps its callback; the
        // newcomer fails.
        let (mut dup_initial, mut dup_message, mut dup_trailing) = (None, None, None);

        if let Some(s) = self.streams.get_mut(key) {
            if let Some(md) = op.send_initial_metadata {
                barrier.register(1);
                if s.write_closed || s.sent_initial_metadata || s.send_initial_metadata.is_some() {
                    let e = send_error(s.write_error.as_ref(), closed_error.as_ref());
                    results.push((barrier.clone(), Err(e)));
                } else {
                    if let Some(d) = md.deadline() {
                        s.deadline = Some(d);
                        deadline = Some(d);
                    }
                    s.send_initial_metadata = Some(md);
                    s.send_initial_done = Some(barrier.clone());
                    if client && s.id == 0 {
                        queue_for_id = true;
                    } else {
                        writable = true;
                    }
                }
            }
            if let Some(message) = op.send_message {
                barrier.register(1);
                if s.write_closed {
                    let e = send_error(s.write_error.as_ref(), closed_error.as_ref());
                    results.push((barrier.clone(), Err(e)));
                } else {
                    s.queue_message(&message, barrier.clone());
                    writable = true;
                }
            }
            if let Some(md) = op.send_trailing_metadata {
                barrier.register(1);
                if s.write_closed || s.send_trailing_metadata.is_some() {
                    let e = send_error(s.write_error.as_ref(), closed_error.as_ref());
                    results.push((barrier.clone(), Err(e)));
                } else {
                    s.send_trailing_metadata = Some(md);
                    s.send_trailing_done = Some(barrier.clone());
                    writable = true;
                }
            }
            if let Some(cb) = op.recv_initial_metadata {
                if s.recv_initial_ready.is_some() {
                    dup_initial = Some(cb);
                } else {
                    s.recv_initial_ready = Some(cb);
                }
            }
            if let Some(cb) = op.recv_message {
                if s.recv_message_ready.is_some() {
                    dup_message = Some(cb);
                } else {
                    s.recv_message_ready = Some(cb);
                }
            }
            if let Some(cb) = op.recv_trailing_metadata {
                if s.recv_trailing_ready.is_some() {
                    dup_trailing = Some(cb);
                } else {
                    s.recv_trailing_ready = Some(cb);
                }
            }
        }
        if dup_initial.is_some() || dup_message.is_some() || dup_trailing.is_some() {
            let error = Error::new("Receive operation already pending").with_code(Code::Internal);
            fail_op_callbacks(self, dup_initial, dup_message, dup_trailing, &error);
        }

        for (b, r) in results {
            self.complete(b, r);
        }
        if let Some(d) = deadline {
            self.arm_deadline(key, d);
        }
        self.maybe_stream_window_update(key);
        if let Some(s) = self.streams.get_mut(key) {
            let effects = s.poll_recv();
            self.deferred.extend(effects);
        }
        if queue_for_id {
            self.waiting_for_concurrency.push_back(key);
            self.maybe_start_some_streams();
        } else if writable {
            self.mark_writable(key);
            self.initiate_write(true, "send_message");
        }
        self.complete(barrier, Ok(()));
    }

    pub fn perform_transport_op(&mut self, op: TransportOp) {
        if let Some(accept) = op.set_accept_stream {
            self.accept_stream = Some(accept);
        }
        if let Some(scheduler) = op.bind_scheduler {
            self.scheduler = scheduler;
        }
        if let Some(error) = op.goaway {
            self.send_goaway(error);
        }
        if let Some(cb) = op.send_ping {
            match &self.closed {
                Some(e) => {
                    let e = e.clone();
                    self.defer(move || cb(Err(e)));
                }
                None => {
                    self.pings.queue(PingPurpose::User(cb));
                    self.initiate_write(true, "application_ping");
                }
            }
        }
        if let Some((last_seen, watcher)) = op.watch_connectivity {
            let immediate = self.connectivity.notify_on_state_change(last_seen, watcher);
            self.notify(immediate.into_iter().collect());
        }
        if let Some(error) = op.disconnect_with_error {
            self.drop_connection(error);
        }
        if let Some(cb) = op.on_consumed {
            self.defer(move || cb(()));
        }
    }

    pub fn destroy_stream(&mut self, key: StreamKey) {
        let Some(s) = self.streams.get_mut(key) else {
            return;
        };
        s.api_held = false;
        if !s.is_closed() {
            self.cancel_from_api(key, Error::new("Stream destroyed").with_code(Code::Cancelled));
        } else if !s.in_stream_map {
            self.streams.remove(key);
        }
    }
}

/// Error for a send on a stream whose write side is closed.
fn send_error(stream: Option<&Error>, transport: Option<&Error>) -> Error {
    stream.or(transport).cloned().unwrap_or_else(|| {
        Error::new("Attempt to send on a closed stream").with_code(Code::Unavailable)
    })
}

fn fail_op_callbacks(
    t: &mut TransportState,
    initial: Option<crate::stream::RecvInitialMetadata>,
    message: Option<crate::stream::RecvMessage>,
    trailing: Option<crate::stream::RecvTrailingMetadata>,
    error: &Error,
) {
    if let Some(cb) = initial {
        let e = error.clone();
        t.defer(move || cb(Err(e)));
    }
    if let Some(cb) = message {
        let e = error.clone();
        t.defer(move || cb(Err(e)));
    }
    if let Some(cb) = trailing {
        let md = synthesize_trailers(error, None);
        t.defer(move || cb(md));
    }
}

/// Build a stream for a peer-initiated id.
pub(crate) fn server_stream(id: u32, outgoing: i64, incoming: i64) -> Stream {
    let mut s = Stream::new();
    s.id = id;
    s.outgoing_window = outgoing;
    s.incoming_window = incoming;
    s.in_stream_map = true;
    s
}
