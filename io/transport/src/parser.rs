//! Inbound path: deframing, header block assembly and per-frame handling.

use crate::api::{ServerData, StreamHandle, Transport};
use crate::args::Role;
use crate::error::Error;
use crate::fallback;
use crate::flow_control;
use crate::ping::PingPurpose;
use crate::settings::SettingKind;
use crate::stream::StreamKey;
use crate::transport::{TransportState, server_stream};
use bytes::{Buf, Bytes, BytesMut};
use grpc::{Code, Metadata, Timeout};
use http2::hpack::header_list_size;
use http2::{
    CONNECTION_PREFACE, DataFrame, ErrorCode, FRAME_HEADER_SIZE, Frame, FrameHeader, FrameType,
    GoAwayFrame, PingFrame, RstStreamFrame, SettingsFrame, StreamId, WindowUpdateFrame,
};
use std::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeframeState {
    /// Server side: bytes of the client preface matched so far.
    ClientPreface(usize),
    AwaitingHeader,
    AwaitingPayload(FrameHeader),
}

/// A header block split across HEADERS and CONTINUATION frames.
pub(crate) struct HeaderBlock {
    pub stream_id: u32,
    pub end_stream: bool,
    pub block: BytesMut,
}

/// Smallest cap on a header block buffered across CONTINUATION frames.
const MIN_HEADER_BLOCK_CAP: usize = 1 << 20;

fn protocol_error(message: impl Into<String>) -> Error {
    Error::new(message).with_http2_error(ErrorCode::ProtocolError)
}

impl TransportState {
    /// Feed bytes read from the endpoint. A parse failure closes the
    /// connection, reported as an HTTP/1.x response when the bytes look
    /// like one.
    pub(crate) fn perform_read(&mut self, data: Bytes) {
        if self.closed.is_some() {
            return;
        }
        self.read_buf.extend_from_slice(&data);
        self.is_parsing = true;
        let result = self.parse_buffered();
        self.is_parsing = false;
        for key in std::mem::take(&mut self.pending_removals) {
            self.remove_stream(key);
        }
        if let Err(error) = result {
            let error = fallback::http1_error(&self.read_buf).unwrap_or(error);
            self.drop_connection(error);
        }
    }

    fn parse_buffered(&mut self) -> Result<(), Error> {
        loop {
            match self.deframe {
                DeframeState::ClientPreface(matched) => {
                    let want = &CONNECTION_PREFACE[matched..];
                    let n = want.len().min(self.read_buf.len());
                    if self.read_buf[..n] != want[..n] {
                        return Err(protocol_error("Connect string mismatch"));
                    }
                    self.read_buf.advance(n);
                    if matched + n < CONNECTION_PREFACE.len() {
                        self.deframe = DeframeState::ClientPreface(matched + n);
                        return Ok(());
                    }
                    self.deframe = DeframeState::AwaitingHeader;
                }
                DeframeState::AwaitingHeader => {
                    let Some(header) = self.frame_decoder.decode_header(&self.read_buf)? else {
                        return Ok(());
                    };
                    self.read_buf.advance(FRAME_HEADER_SIZE);
                    self.deframe = DeframeState::AwaitingPayload(header);
                }
                DeframeState::AwaitingPayload(header) => {
                    let len = header.length as usize;
                    if self.read_buf.len() < len {
                        return Ok(());
                    }
                    let payload = self.read_buf.split_to(len).freeze();
                    self.deframe = DeframeState::AwaitingHeader;
                    self.dispatch(header, payload)?;
                    if self.closed.is_some() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, header: FrameHeader, payload: Bytes) -> Result<(), Error> {
        let is_continuation = header.kind() == Some(FrameType::Continuation);
        match &self.header_block {
            Some(pending) if !is_continuation || header.stream_id.value() != pending.stream_id => {
                return Err(protocol_error(format!(
                    "Expected CONTINUATION for stream {}",
                    pending.stream_id
                )));
            }
            None if is_continuation => {
                return Err(protocol_error("Unexpected CONTINUATION frame"));
            }
            _ => {}
        }

        let frame = self.frame_decoder.decode_payload(header, payload)?;
        trace!(kind = ?header.kind(), stream = header.stream_id.value(), len = header.length, "frame");
        if matches!(frame, Frame::Data(_) | Frame::Headers(_)) {
            self.pings.note_data_received();
        }
        match frame {
            Frame::Data(f) => self.on_data(f),
            Frame::Headers(f) => {
                let id = f.stream_id.value();
                if f.end_headers {
                    self.on_header_block(id, f.end_stream, &f.header_block)
                } else {
                    self.check_header_block_len(f.header_block.len())?;
                    self.header_block = Some(HeaderBlock {
                        stream_id: id,
                        end_stream: f.end_stream,
                        block: BytesMut::from(&f.header_block[..]),
                    });
                    Ok(())
                }
            }
            Frame::Continuation(f) => {
                let Some(mut pending) = self.header_block.take() else {
                    return Ok(());
                };
                self.check_header_block_len(pending.block.len() + f.header_block.len())?;
                pending.block.extend_from_slice(&f.header_block);
                if f.end_headers {
                    self.on_header_block(pending.stream_id, pending.end_stream, &pending.block)
                } else {
                    self.header_block = Some(pending);
                    Ok(())
                }
            }
            Frame::Settings(f) => self.on_settings(f),
            Frame::WindowUpdate(f) => self.on_window_update(f),
            Frame::Ping(f) => {
                self.on_ping(f);
                Ok(())
            }
            Frame::GoAway(f) => {
                self.on_goaway(f);
                Ok(())
            }
            Frame::RstStream(f) => {
                self.on_rst_stream(f);
                Ok(())
            }
            Frame::PushPromise(_) => Err(protocol_error("Unexpected PUSH_PROMISE")),
            Frame::Priority(_) | Frame::Unknown(_) => Ok(()),
        }
    }

    /// Largest header list this side accepts: what it asks for, and what
    /// the peer has acknowledged.
    fn metadata_limit(&self) -> usize {
        self.settings
            .local(SettingKind::MaxHeaderListSize)
            .min(self.settings.acked(SettingKind::MaxHeaderListSize)) as usize
    }

    fn check_header_block_len(&self, len: usize) -> Result<(), Error> {
        let cap = self.metadata_limit().saturating_mul(2).max(MIN_HEADER_BLOCK_CAP);
        if len > cap {
            return Err(Error::new(format!(
                "header block of {} bytes exceeds cap of {}",
                len, cap
            ))
            .with_http2_error(ErrorCode::EnhanceYourCalm));
        }
        Ok(())
    }

    fn on_data(&mut self, f: DataFrame) -> Result<(), Error> {
        let len = f.flow_controlled_len;
        self.flow.recv_data(len)?;
        self.maybe_connection_window_update();
        self.maybe_bdp_ping();

        let id = f.stream_id.value();
        let Some(&key) = self.stream_table.get(&id) else {
            trace!(id, "DATA for unknown stream");
            return Ok(());
        };
        let Some(s) = self.streams.get_mut(key) else {
            return Ok(());
        };
        if s.read_closed {
            return Ok(());
        }
        if len as i64 > s.incoming_window {
            return Err(Error::new(format!(
                "frame of {} bytes exceeds stream {} window of {}",
                len, id, s.incoming_window
            ))
            .with_http2_error(ErrorCode::FlowControlError));
        }
        flow_control::debit(&mut s.incoming_window, len);

        s.decoder.feed(&f.data);
        let mut failure = None;
        loop {
            match s.decoder.next_message() {
                Ok(Some(message)) => s.incoming_frames.push_back(message),
                Ok(None) => break,
                Err(e) => {
                    failure = Some(Error::from(e));
                    break;
                }
            }
        }
        if failure.is_none()
            && f.end_stream
            && let Err(e) = s.decoder.finish()
        {
            failure = Some(Error::from(e));
        }
        let effects = s.poll_recv();
        self.deferred.extend(effects);

        if let Some(error) = failure {
            self.cancel_from_api(key, error.with_stream_id(id));
            return Ok(());
        }
        if f.end_stream {
            self.on_end_stream(key);
        }
        self.maybe_stream_window_update(key);
        Ok(())
    }

    /// The peer sent END_STREAM outside a trailing header block.
    fn on_end_stream(&mut self, key: StreamKey) {
        let error = if self.role.is_client() {
            Some(Error::new("Stream ended without trailing metadata").with_code(Code::Internal))
        } else {
            None
        };
        self.mark_stream_closed(key, true, false, error);
    }

    fn on_header_block(&mut self, id: u32, end_stream: bool, block: &[u8]) -> Result<(), Error> {
        // The HPACK context must see every block, even for streams we drop.
        let fields = self.hpack_decoder.decode(block)?;
        let size = header_list_size(&fields);

        let key = match self.stream_table.get(&id) {
            Some(&key) => key,
            None if self.role.is_client() => {
                trace!(id, "HEADERS for unknown stream");
                return Ok(());
            }
            None => match self.accept_incoming(id)? {
                Some(key) => key,
                None => return Ok(()),
            },
        };

        let limit = self.metadata_limit();
        if size > limit {
            debug!(id, size, limit, "received metadata too large");
            self.cancel_from_api(
                key,
                Error::new(format!(
                    "received metadata of {} bytes exceeds limit of {}",
                    size, limit
                ))
                .with_code(Code::ResourceExhausted)
                .with_stream_id(id),
            );
            return Ok(());
        }

        let mut metadata = match Metadata::from_header_fields(fields) {
            Ok(md) => md,
            Err(field) => {
                let name = String::from_utf8_lossy(&field.name).into_owned();
                self.cancel_from_api(
                    key,
                    Error::new(format!("Invalid header {}", name))
                        .with_code(Code::Internal)
                        .with_stream_id(id),
                );
                return Ok(());
            }
        };

        let client = self.role.is_client();
        let mut deadline = None;
        let mut invalid_trailers = false;
        let Some(s) = self.streams.get_mut(key) else {
            return Ok(());
        };
        if s.read_closed {
            return Ok(());
        }
        if metadata.get("grpc-status").is_some_and(|v| v != "0") {
            s.seen_error = true;
        }
        if !s.received_initial_metadata {
            s.received_initial_metadata = true;
            if client && end_stream {
                s.recv_initial_metadata = Some(Metadata::new());
                s.recv_trailing_metadata = Some(metadata);
            } else {
                if !client
                    && let Some(timeout) = metadata.get("grpc-timeout").and_then(Timeout::parse)
                {
                    let d = Instant::now() + timeout.as_duration();
                    metadata.set_deadline(d);
                    s.deadline = Some(d);
                    deadline = Some(d);
                }
                s.recv_initial_metadata = Some(metadata);
            }
        } else if end_stream {
            s.recv_trailing_metadata = Some(metadata);
        } else {
            invalid_trailers = true;
        }
        let effects = s.poll_recv();
        let write_closed = s.write_closed;
        let announced = s.sent_initial_metadata;
        self.deferred.extend(effects);

        if let Some(d) = deadline {
            self.arm_deadline(key, d);
        }
        if invalid_trailers {
            self.cancel_from_api(
                key,
                Error::new("Trailing metadata without END_STREAM")
                    .with_code(Code::Internal)
                    .with_stream_id(id),
            );
            return Ok(());
        }
        if end_stream {
            if client && !write_closed {
                if announced {
                    self.frame_encoder.write_rst_stream(
                        StreamId::new(id),
                        ErrorCode::NoError.to_u32(),
                        &mut self.qbuf,
                    );
                    self.initiate_write(false, "close_from_server");
                }
                self.mark_stream_closed(key, true, true, None);
            } else {
                self.mark_stream_closed(key, true, false, None);
            }
        }
        Ok(())
    }

    /// Server side: open a stream for a peer HEADERS frame, or refuse it.
    fn accept_incoming(&mut self, id: u32) -> Result<Option<StreamKey>, Error> {
        if id % 2 == 0 {
            return Err(protocol_error(format!("Client opened even stream id {}", id)));
        }
        if id <= self.last_incoming_stream_id {
            trace!(id, "HEADERS for closed stream");
            return Ok(None);
        }
        self.last_incoming_stream_id = id;

        let limit = self.settings.local(SettingKind::MaxConcurrentStreams) as usize;
        let refuse = if self.goaway_sent {
            Some("GOAWAY sent")
        } else if self.stream_table.len() >= limit {
            Some("too many streams")
        } else if self.accept_stream.is_none() {
            Some("no accept callback")
        } else {
            None
        };
        let (Some(accept), Some(shared), None) = (self.accept_stream.clone(), self.this.upgrade(), refuse) else {
            debug!(id, reason = refuse.unwrap_or("transport gone"), "refusing stream");
            self.frame_encoder.write_rst_stream(
                StreamId::new(id),
                ErrorCode::RefusedStream.to_u32(),
                &mut self.qbuf,
            );
            self.initiate_write(false, "refuse_stream");
            return Ok(None);
        };

        let outgoing = self.settings.peer(SettingKind::InitialWindowSize) as i64;
        let incoming = self.settings.sent(SettingKind::InitialWindowSize) as i64;
        let key = self.streams.insert(server_stream(id, outgoing, incoming));
        self.stream_table.insert(id, key);
        debug!(id, "accepted stream");

        let handle = StreamHandle::new(Transport::from_shared(shared), key);
        self.defer(move || accept(ServerData::new(handle)));
        Ok(Some(key))
    }

    fn on_settings(&mut self, f: SettingsFrame) -> Result<(), Error> {
        if f.ack {
            let before = self.settings.acked(SettingKind::InitialWindowSize) as i64;
            if self.settings.ack() {
                self.hpack_decoder
                    .set_max_table_size(self.settings.acked(SettingKind::HeaderTableSize) as usize);
                let delta = self.settings.acked(SettingKind::InitialWindowSize) as i64 - before;
                // Growth was credited when the SETTINGS went out.
                if delta < 0 {
                    for key in self.stream_table.values().copied().collect::<Vec<_>>() {
                        if let Some(s) = self.streams.get_mut(key) {
                            flow_control::adjust(&mut s.incoming_window, delta);
                        }
                    }
                }
            }
            return Ok(());
        }

        let changes = self.settings.apply_peer(&f.settings)?;
        for change in changes {
            match change.kind {
                SettingKind::HeaderTableSize => {
                    self.hpack_encoder.set_peer_table_size(change.new as usize);
                }
                SettingKind::InitialWindowSize => {
                    let delta = change.new as i64 - change.old as i64;
                    let keys: Vec<_> = self.stream_table.values().copied().collect();
                    for key in keys {
                        let reopened = self.streams.get_mut(key).is_some_and(|s| {
                            flow_control::adjust(&mut s.outgoing_window, delta) && s.has_pending_send()
                        });
                        if reopened {
                            self.mark_writable(key);
                            self.initiate_write(false, "flow_control_unstalled_by_setting");
                        }
                    }
                }
                _ => {}
            }
        }
        self.settings_acks_owed += 1;
        self.initiate_write(false, "settings_ack");
        self.maybe_start_some_streams();
        Ok(())
    }

    fn on_window_update(&mut self, f: WindowUpdateFrame) -> Result<(), Error> {
        if f.stream_id.is_connection_level() {
            let was_closed = self.flow.outgoing <= 0;
            flow_control::credit(&mut self.flow.outgoing, f.increment)?;
            if was_closed && self.flow.outgoing > 0 {
                let stalled: Vec<_> = self.stalled_by_transport.drain(..).collect();
                for key in stalled {
                    self.mark_writable(key);
                }
                self.initiate_write(false, "transport_flow_control_unstalled");
            }
            return Ok(());
        }

        let id = f.stream_id.value();
        let Some(&key) = self.stream_table.get(&id) else {
            return Ok(());
        };
        let Some(s) = self.streams.get_mut(key) else {
            return Ok(());
        };
        if let Err(error) = flow_control::credit(&mut s.outgoing_window, f.increment) {
            self.cancel_from_api(key, error.with_stream_id(id));
            return Ok(());
        }
        if s.has_pending_send() {
            self.mark_writable(key);
            self.initiate_write(false, "stream_flow_control_unstalled");
        }
        Ok(())
    }

    fn on_ping(&mut self, f: PingFrame) {
        if !f.ack {
            self.pings.owe_ack(f.data);
            self.initiate_write(false, "ping_response");
            if self.role == Role::Server
                && self.pings.on_ping_received(
                    Instant::now(),
                    !self.stream_table.is_empty(),
                    self.config.keepalive_permit_without_calls,
                )
            {
                warn!(peer = %self.peer, "too many pings from peer");
                self.goaway_and_close(
                    Error::new("too_many_pings").with_http2_error(ErrorCode::EnhanceYourCalm),
                    Error::new("Too many pings").with_code(Code::Unavailable),
                );
            }
            return;
        }
        match self.pings.ack(f.data) {
            Some(PingPurpose::User(cb)) => self.defer(move || cb(Ok(()))),
            Some(PingPurpose::Keepalive) => self.keepalive_ping_acked(),
            Some(PingPurpose::Bdp) => {
                if let Some(target) = self.flow.bdp_complete_ping(Instant::now()) {
                    debug!(target, "BDP estimate grew, raising stream window");
                    self.settings.push(SettingKind::InitialWindowSize, target);
                    if self.settings.is_dirty() {
                        self.initiate_write(false, "bdp_update");
                    }
                }
            }
            None => trace!(data = ?f.data, "PING ack for unknown ping"),
        }
    }

    fn on_goaway(&mut self, f: GoAwayFrame) {
        let last = f.last_stream_id.value();
        let code = ErrorCode::from_u32(f.error_code);
        let debug_data = String::from_utf8_lossy(&f.debug_data).into_owned();
        if code == ErrorCode::NoError {
            debug!(last, %debug_data, "received GOAWAY");
        } else {
            warn!(last, code = code.as_str(), %debug_data, "received GOAWAY");
        }
        self.goaway_received = Some(last);
        self.set_connectivity(
            crate::connectivity::ConnectivityState::TransientFailure,
            "GOAWAY received",
        );
        if !self.role.is_client() {
            return;
        }
        if code == ErrorCode::EnhanceYourCalm && debug_data == "too_many_pings" {
            self.back_off_keepalive();
        }

        let error = Error::new(format!("GOAWAY received: {}", code.as_str()))
            .with_code(Code::Unavailable)
            .with_transparent_retry();
        let unprocessed: Vec<(u32, StreamKey)> = self
            .stream_table
            .range(last.saturating_add(1)..)
            .map(|(id, key)| (*id, *key))
            .collect();
        for (id, key) in unprocessed {
            self.mark_stream_closed(key, true, true, Some(error.clone().with_stream_id(id)));
        }
        self.maybe_start_some_streams();
    }

    fn on_rst_stream(&mut self, f: RstStreamFrame) {
        let id = f.stream_id.value();
        let Some(&key) = self.stream_table.get(&id) else {
            return;
        };
        let code = ErrorCode::from_u32(f.error_code);
        let error = Error::new(format!("Received RST_STREAM with error code {}", f.error_code))
            .with_http2_error(code)
            .with_stream_id(id);
        self.mark_stream_closed(key, true, true, Some(error));
    }
}
