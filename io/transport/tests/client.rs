//! Client transports driven through the public API against a scripted peer.

mod common;

use bytes::Bytes;
use common::*;
use grpc::Metadata;
use http2::{ErrorCode, Frame, Setting, SettingId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use transport::{ConnectivityState, Error, Role, StreamHandle, StreamOp, TransportOp, args};

/// Open a stream and send `request_headers` with whatever else `op` holds.
fn open(h: &Harness, mut op: StreamOp) -> (StreamHandle, Shared) {
    let stream = h.transport.init_stream(None).unwrap();
    let rx = Shared::default();
    op.send_initial_metadata.get_or_insert_with(request_headers);
    recv_initial(&mut op, &rx);
    recv_message(&mut op, &rx);
    recv_trailing(&mut op, &rx);
    on_complete(&mut op, &rx);
    h.transport.perform_stream_op(&stream, op);
    (stream, rx)
}

fn status_of(rx: &Shared) -> Option<String> {
    rx.lock()
        .trailing
        .as_ref()
        .and_then(|md| md.get("grpc-status").map(str::to_string))
}

#[test]
fn test_unary_round_trip() {
    let mut h = Harness::new(Role::Client, &[]);
    let frames = h.written_frames();
    assert!(matches!(&frames[..], [Frame::Settings(s)] if !s.ack));

    let (stream, rx) = open(
        &h,
        StreamOp {
            send_message: Some(Bytes::from_static(b"hello")),
            send_trailing_metadata: Some(Metadata::new()),
            ..Default::default()
        },
    );
    assert_eq!(stream.id(), 1);

    let frames = h.written_frames();
    assert_eq!(frames.len(), 3, "{:?}", frames);
    let Frame::Headers(headers) = &frames[0] else {
        panic!("expected HEADERS, got {:?}", frames[0]);
    };
    assert_eq!(headers.stream_id.value(), 1);
    assert!(!headers.end_stream);
    let sent = h.peer.header_block(&headers.header_block);
    assert_eq!(sent.get(":path"), Some("/echo.Echo/Say"));
    assert_eq!(sent.get("te"), Some("trailers"));
    assert!(matches!(&frames[1], Frame::Data(d) if &d.data[..] == b"\0\0\0\0\x05hello"));
    assert!(matches!(&frames[2], Frame::Data(d) if d.end_stream && d.data.is_empty()));
    assert!(matches!(rx.lock().completed[..], [Ok(())]));

    // Half closed: the stream holds its id until the response ends.
    assert_eq!(h.transport.stream_count(), 1);

    let response = h
        .peer
        .settings(&[])
        .headers(1, false, &[(":status", "200"), ("content-type", "application/grpc")])
        .message(1, false, b"world")
        .headers(1, true, &[("grpc-status", "0")])
        .take();
    h.deliver(response);

    {
        let rx = rx.lock();
        let initial = rx.initial.as_ref().unwrap().as_ref().unwrap();
        assert_eq!(initial.get(":status"), Some("200"));
        assert_eq!(rx.messages, [Bytes::from_static(b"world")]);
        assert_eq!(rx.trailing.as_ref().unwrap().get("grpc-status"), Some("0"));
    }
    assert_eq!(h.transport.stream_count(), 0);

    // The first DATA opens the connection window to its full target.
    let frames = h.written_frames();
    assert!(matches!(
        &frames[..],
        [Frame::Settings(s), Frame::WindowUpdate(w)] if s.ack && w.stream_id.is_connection_level()
    ));
}

#[test]
fn test_trailers_only_response() {
    let mut h = Harness::new(Role::Client, &[]);
    let (_stream, rx) = open(&h, StreamOp::default());
    h.written_frames();

    let response = h
        .peer
        .headers(
            1,
            true,
            &[(":status", "200"), ("grpc-status", "5"), ("grpc-message", "no such thing")],
        )
        .take();
    h.deliver(response);

    let rx = rx.lock();
    assert!(rx.initial.as_ref().unwrap().as_ref().unwrap().is_empty());
    assert_eq!(rx.trailing.as_ref().unwrap().get("grpc-status"), Some("5"));
    drop(rx);

    // The client had not half closed, so it resets the stream.
    let frames = h.written_frames();
    assert!(matches!(
        &frames[..],
        [Frame::RstStream(r)] if r.stream_id.value() == 1 && r.error_code == ErrorCode::NoError.to_u32()
    ));
    assert_eq!(h.transport.stream_count(), 0);
}

#[test]
fn test_goaway_fails_unprocessed_streams() {
    let mut h = Harness::new(Role::Client, &[]);
    let streams: Vec<_> = (0..6).map(|_| open(&h, StreamOp::default())).collect();
    let ids: Vec<u32> = streams.iter().map(|(s, _)| s.id()).collect();
    assert_eq!(ids, [1, 3, 5, 7, 9, 11]);
    h.written_frames();

    let goaway = h.peer.goaway(7, ErrorCode::NoError).take();
    h.deliver(goaway);

    for (stream, rx) in &streams {
        if stream.id() > 7 {
            assert_eq!(status_of(rx).as_deref(), Some("14"), "stream {}", stream.id());
        } else {
            assert_eq!(status_of(rx), None, "stream {}", stream.id());
        }
    }
    assert_eq!(h.transport.stream_count(), 4);
    assert_eq!(h.transport.connectivity_state(), ConnectivityState::TransientFailure);

    // New streams are not started once a GOAWAY arrived.
    let (late, rx) = open(&h, StreamOp::default());
    assert_eq!(late.id(), 0);
    assert_eq!(status_of(&rx).as_deref(), Some("14"));
    let completed = rx.lock().completed.len();
    assert_eq!(completed, 1);
}

#[test]
fn test_http1_response_fails_streams() {
    let mut h = Harness::new(Role::Client, &[]);
    let (_stream, rx) = open(&h, StreamOp::default());
    h.written_frames();

    h.deliver(Bytes::from_static(
        b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n",
    ));

    assert_eq!(status_of(&rx).as_deref(), Some("12"));
    let message = rx.lock().trailing.as_ref().unwrap().get("grpc-message").map(str::to_string);
    assert_eq!(message.as_deref(), Some("Trying to connect an http1.x server"));
    assert_eq!(h.transport.connectivity_state(), ConnectivityState::Shutdown);
    assert!(h.endpoint.is_shutdown());
    assert!(h.transport.init_stream(None).is_err());
}

#[test]
fn test_stream_ids_exhausted() {
    let h = Harness::new(Role::Client, &[(args::INITIAL_SEQUENCE_NUMBER, 0x7fff_ffff)]);
    let (first, first_rx) = open(&h, StreamOp::default());
    assert_eq!(first.id(), 0x7fff_ffff);
    assert_eq!(status_of(&first_rx), None);
    assert_eq!(h.transport.connectivity_state(), ConnectivityState::TransientFailure);

    let (second, rx) = open(&h, StreamOp::default());
    assert_eq!(second.id(), 0);
    assert_eq!(status_of(&rx).as_deref(), Some("14"));
    assert!(rx.lock().completed[0].is_err());
}

#[test]
fn test_concurrency_limit_queues_streams() {
    let mut h = Harness::new(Role::Client, &[]);
    let settings = h
        .peer
        .settings(&[Setting {
            id: SettingId::MaxConcurrentStreams,
            value: 1,
        }])
        .take();
    h.deliver(settings);

    let (first, _) = open(&h, StreamOp::default());
    let (second, _) = open(&h, StreamOp::default());
    assert_eq!(first.id(), 1);
    assert_eq!(second.id(), 0);
    h.written_frames();

    let end = h.peer.rst_stream(1, ErrorCode::Cancel).take();
    h.deliver(end);
    assert_eq!(second.id(), 3);
    let frames = h.written_frames();
    assert!(frames
        .iter()
        .any(|f| matches!(f, Frame::Headers(hd) if hd.stream_id.value() == 3)));
}

#[test]
fn test_stream_flow_control() {
    let mut h = Harness::new(Role::Client, &[]);
    let settings = h
        .peer
        .settings(&[Setting {
            id: SettingId::InitialWindowSize,
            value: 10,
        }])
        .take();
    h.deliver(settings);
    h.written_frames();

    let (_stream, rx) = open(
        &h,
        StreamOp {
            send_message: Some(Bytes::from(vec![1u8; 20])),
            ..Default::default()
        },
    );
    let sizes = |frames: &[Frame]| -> Vec<usize> {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::Data(d) => Some(d.data.len()),
                _ => None,
            })
            .collect()
    };
    let frames = h.written_frames();
    assert_eq!(sizes(&frames), [10]);
    assert!(rx.lock().completed.is_empty());

    let update = h.peer.window_update(1, 100).take();
    h.deliver(update);
    let frames = h.written_frames();
    assert_eq!(sizes(&frames), [15]);
    assert!(matches!(rx.lock().completed[..], [Ok(())]));
}

#[test]
fn test_user_ping() {
    let mut h = Harness::new(Role::Client, &[]);
    h.written_frames();
    let acked = Arc::new(Mutex::new(None));
    let a = acked.clone();
    h.transport.perform_transport_op(TransportOp {
        send_ping: Some(Box::new(move |r: Result<(), Error>| *a.lock() = Some(r))),
        ..Default::default()
    });

    let frames = h.written_frames();
    let [Frame::Ping(ping)] = &frames[..] else {
        panic!("expected one PING, got {:?}", frames);
    };
    assert!(!ping.ack);
    assert!(acked.lock().is_none());

    let ack = h.peer.ping(true, ping.data).take();
    h.deliver(ack);
    assert!(matches!(*acked.lock(), Some(Ok(()))));
}

#[test]
fn test_ping_from_peer_is_acked() {
    let mut h = Harness::new(Role::Client, &[]);
    h.written_frames();
    let ping = h.peer.ping(false, *b"abcdefgh").take();
    h.deliver(ping);
    let frames = h.written_frames();
    assert!(matches!(&frames[..], [Frame::Ping(p)] if p.ack && &p.data == b"abcdefgh"));
}

#[test]
fn test_destroy_transport() {
    let h = Harness::new(Role::Client, &[]);
    let (_stream, rx) = open(&h, StreamOp::default());
    let seen = Arc::new(Mutex::new(None));
    let s = seen.clone();
    h.transport.perform_transport_op(TransportOp {
        watch_connectivity: Some((
            ConnectivityState::Ready,
            Box::new(move |state: ConnectivityState| *s.lock() = Some(state)),
        )),
        ..Default::default()
    });
    assert!(seen.lock().is_none());

    h.transport.destroy_transport();
    assert_eq!(status_of(&rx).as_deref(), Some("14"));
    assert_eq!(*seen.lock(), Some(ConnectivityState::Shutdown));
    assert!(h.endpoint.is_shutdown());
    assert_eq!(h.transport.stream_count(), 0);

    let pinged = Arc::new(Mutex::new(None));
    let p = pinged.clone();
    h.transport.perform_transport_op(TransportOp {
        send_ping: Some(Box::new(move |r: Result<(), Error>| *p.lock() = Some(r))),
        ..Default::default()
    });
    assert!(matches!(*pinged.lock(), Some(Err(_))));
}

#[test]
fn test_deadline_cancels_stream() {
    let mut h = Harness::new(Role::Client, &[]);
    h.written_frames();
    let mut md = request_headers();
    md.set_deadline(Instant::now() + Duration::from_secs(30));
    let (_stream, rx) = open(
        &h,
        StreamOp {
            send_initial_metadata: Some(md),
            ..Default::default()
        },
    );
    assert_eq!(h.scheduler.timer_count(), 1);

    let frames = h.written_frames();
    let Frame::Headers(headers) = &frames[0] else {
        panic!("expected HEADERS, got {:?}", frames[0]);
    };
    let sent = h.peer.header_block(&headers.header_block);
    assert!(sent.get("grpc-timeout").is_some());

    h.scheduler.fire_timers();
    assert_eq!(status_of(&rx).as_deref(), Some("4"));
    let frames = h.written_frames();
    assert!(matches!(
        &frames[..],
        [Frame::RstStream(r)] if r.error_code == ErrorCode::Cancel.to_u32()
    ));
}

#[test]
fn test_cancel_before_start_sends_nothing() {
    let mut h = Harness::new(Role::Client, &[]);
    let settings = h
        .peer
        .settings(&[Setting {
            id: SettingId::MaxConcurrentStreams,
            value: 0,
        }])
        .take();
    h.deliver(settings);
    h.written_frames();

    let (stream, rx) = open(&h, StreamOp::default());
    assert_eq!(stream.id(), 0);
    h.transport.perform_stream_op(
        &stream,
        StreamOp {
            cancel: Some(Error::new("Cancelled").with_code(grpc::Code::Cancelled)),
            ..Default::default()
        },
    );
    assert_eq!(status_of(&rx).as_deref(), Some("1"));
    assert!(h.written_frames().is_empty());
}

#[test]
fn test_get_peer() {
    let h = Harness::new(Role::Client, &[]);
    assert_eq!(h.transport.get_peer(), "ipv4:127.0.0.1:50051");
}

#[test]
fn test_keepalive_watchdog_fails_streams() {
    let mut h = Harness::new(
        Role::Client,
        &[
            (args::KEEPALIVE_TIME_MS, 1000),
            (args::KEEPALIVE_TIMEOUT_MS, 500),
            (args::MIN_TIME_BETWEEN_PINGS_MS, 0),
        ],
    );
    h.written_frames();
    assert_eq!(h.scheduler.timer_count(), 1);

    // Nothing open: the timer re-arms without pinging.
    h.scheduler.fire_timers();
    assert!(h.written_frames().is_empty());
    assert_eq!(h.scheduler.timer_count(), 1);

    let (_stream, rx) = open(&h, StreamOp::default());
    h.written_frames();
    h.scheduler.fire_timers();
    let frames = h.written_frames();
    let [Frame::Ping(ping)] = &frames[..] else {
        panic!("expected PING, got {:?}", frames);
    };
    assert!(!ping.ack);

    // Answered: the watchdog stands down and the next keepalive is armed.
    let ack = h.peer.ping(true, ping.data).take();
    h.deliver(ack);
    assert_eq!(h.scheduler.timer_count(), 2);
    h.scheduler.fire_timers();
    let frames = h.written_frames();
    assert!(matches!(&frames[..], [Frame::Ping(p)] if !p.ack), "{:?}", frames);
    assert_eq!(h.transport.connectivity_state(), ConnectivityState::Ready);

    // Unanswered.
    h.scheduler.fire_timers();
    assert_eq!(h.transport.connectivity_state(), ConnectivityState::Shutdown);
    assert_eq!(status_of(&rx).as_deref(), Some("13"));
}
