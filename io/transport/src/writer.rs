//! Outbound path: collects everything owed to the peer into one batch.

use crate::error::Error;
use crate::flow_control;
use crate::settings::SettingKind;
use crate::stream::StreamKey;
use crate::transport::TransportState;
use bytes::{Bytes, BytesMut};
use grpc::{Code, Timeout};
use http2::hpack::header_list_size;
use http2::{CONNECTION_PREFACE, ErrorCode, HeaderField, StreamId};
use std::time::Instant;
use tracing::{debug, trace};

impl TransportState {
    /// Whether the next write would have anything to say.
    pub(crate) fn unlocking_check_writes(&self) -> bool {
        self.closed.is_none()
            && (!self.sent_preface
                || self.settings.is_dirty()
                || self.settings_acks_owed > 0
                || self.pings.has_pending_writes()
                || self.pending_goaway.is_some()
                || !self.qbuf.is_empty()
                || !self.writable.is_empty())
    }

    /// Build the next batch. `None` when nothing is left to send.
    pub(crate) fn begin_write(&mut self) -> Option<Vec<Bytes>> {
        if self.closed.is_some() {
            return None;
        }
        let mut buf = BytesMut::new();
        if !self.sent_preface {
            buf.extend_from_slice(CONNECTION_PREFACE);
            self.sent_preface = true;
        }

        if self.settings.is_dirty() {
            let before = self.settings.sent(SettingKind::InitialWindowSize) as i64;
            let diff = self.settings.take_diff();
            self.frame_encoder.write_settings(&diff, &mut buf);
            // The peer may use a larger window as soon as it reads the
            // frame; a smaller one only applies once acknowledged.
            let delta = self.settings.sent(SettingKind::InitialWindowSize) as i64 - before;
            if delta > 0 {
                for key in self.stream_table.values() {
                    if let Some(s) = self.streams.get_mut(*key) {
                        flow_control::adjust(&mut s.incoming_window, delta);
                    }
                }
            }
        }
        for _ in 0..std::mem::take(&mut self.settings_acks_owed) {
            self.frame_encoder.write_settings_ack(&mut buf);
        }
        for data in self.pings.take_acks() {
            self.frame_encoder.write_ping(true, data, &mut buf);
        }
        let now = Instant::now();
        let started = self.pings.start_queued(now);
        for data in &started.payloads {
            self.frame_encoder.write_ping(false, *data, &mut buf);
        }
        if started.bdp {
            self.flow.bdp_start_ping(now);
            self.restart_keepalive_timer();
        }
        if started.keepalive {
            self.keepalive_ping_started();
        }
        if let Some(at) = started.retry_at {
            self.arm_ping_retry(at);
        }
        if let Some(goaway) = self.pending_goaway.take() {
            self.frame_encoder.write_goaway(
                StreamId::new(self.last_incoming_stream_id),
                goaway.error_code.to_u32(),
                &goaway.debug_data,
                &mut buf,
            );
            self.close_after_write = goaway.then_close;
        }
        buf.extend_from_slice(&self.qbuf.split());

        // A stream cancelled here queues a status block whose HPACK
        // insertions later header blocks depend on, so it goes out in place.
        let writable = std::mem::take(&mut self.writable);
        for key in writable {
            let before = buf.len();
            self.write_stream(key, &mut buf);
            if buf.len() > before {
                self.pings.note_data_sent();
            }
            buf.extend_from_slice(&self.qbuf.split());
        }

        if buf.is_empty() {
            None
        } else {
            Some(vec![buf.freeze()])
        }
    }

    /// Write what flow control allows for one stream: initial metadata,
    /// then DATA, then trailers once every message is out.
    fn write_stream(&mut self, key: StreamKey, buf: &mut BytesMut) {
        let client = self.role.is_client();
        let header_limit = self.settings.peer(SettingKind::MaxHeaderListSize) as usize;
        let max_frame = self.frame_encoder.max_frame_size() as i64;

        let Some(s) = self.streams.get_mut(key) else {
            return;
        };
        s.in_writable_list = false;
        if !s.in_stream_map || s.write_closed {
            return;
        }
        let id = s.id;

        if let Some(md) = &s.send_initial_metadata {
            let mut fields = md.to_header_fields();
            if client && let Some(deadline) = md.deadline() {
                let timeout = Timeout::from_duration(deadline.saturating_duration_since(Instant::now()));
                fields.push(HeaderField::new("grpc-timeout", timeout.to_header_value()));
            }
            let size = header_list_size(&fields);
            if size > header_limit {
                let error = metadata_too_large("Initial", size, header_limit, id);
                self.cancel_from_api(key, error);
                return;
            }
            let mut block = Vec::new();
            self.hpack_encoder.encode(&fields, &mut block);
            self.frame_encoder.write_headers(StreamId::new(id), false, &block, buf);
            s.send_initial_metadata = None;
            s.sent_initial_metadata = true;
            self.write_completions.extend(s.send_initial_done.take());
            trace!(id, size, "wrote initial metadata");
        }

        let trailers_only = !client && s.outgoing.is_empty() && s.send_trailing_metadata.is_some();
        if !s.sent_initial_metadata && !trailers_only {
            return;
        }

        while !s.outgoing.is_empty() {
            let window = s.outgoing_window.min(self.flow.outgoing);
            if window <= 0 {
                if s.outgoing_window > 0 {
                    self.stalled_by_transport.push_back(key);
                }
                trace!(id, stream = s.outgoing_window, connection = self.flow.outgoing, "flow control stalled");
                return;
            }
            let n = (s.outgoing.len() as i64).min(window).min(max_frame) as usize;
            let chunk = s.outgoing.split_to(n);
            self.frame_encoder.write_data(StreamId::new(id), false, &chunk, buf);
            flow_control::debit(&mut s.outgoing_window, n as u32);
            flow_control::debit(&mut self.flow.outgoing, n as u32);
            self.write_completions.extend(s.note_flushed(n));
        }

        let Some(md) = s.send_trailing_metadata.take() else {
            return;
        };
        if client && md.is_empty() {
            self.frame_encoder.write_data(StreamId::new(id), true, &[], buf);
        } else {
            let mut fields = Vec::new();
            if !s.sent_initial_metadata {
                fields.push(HeaderField::new(":status", "200"));
                fields.push(HeaderField::new("content-type", "application/grpc"));
            }
            fields.extend(md.to_header_fields());
            let size = header_list_size(&fields);
            if size > header_limit {
                let error = metadata_too_large("Trailing", size, header_limit, id);
                self.cancel_from_api(key, error);
                return;
            }
            let mut block = Vec::new();
            self.hpack_encoder.encode(&fields, &mut block);
            self.frame_encoder.write_headers(StreamId::new(id), true, &block, buf);
        }
        s.sent_initial_metadata = true;
        s.sent_trailing_metadata = true;
        self.write_completions.extend(s.send_trailing_done.take());
        let read_closed = s.read_closed;
        debug!(id, "wrote end of stream");

        if !client && !read_closed {
            // Server is done before the client: stop the client from sending more.
            self.frame_encoder
                .write_rst_stream(StreamId::new(id), ErrorCode::NoError.to_u32(), &mut self.qbuf);
            self.mark_stream_closed(key, true, true, None);
        } else {
            self.mark_stream_closed(key, false, true, None);
        }
    }
}

fn metadata_too_large(which: &str, size: usize, limit: usize, id: u32) -> Error {
    Error::new(format!(
        "{} metadata of {} bytes exceeds peer limit of {}",
        which, size, limit
    ))
    .with_code(Code::ResourceExhausted)
    .with_stream_id(id)
}
