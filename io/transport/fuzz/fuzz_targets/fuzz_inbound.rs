#![no_main]

//! Arbitrary peer bytes against a server transport: nothing may panic, and a
//! transport that closed must have shut its endpoint down.

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use transport::{
    Callback, ChannelArgs, ConnectivityState, Endpoint, Role, Scheduler, ServerData, StreamOp,
    Task, Transport, TransportOp, args,
};

#[derive(Default)]
struct FuzzEndpoint {
    pending_read: Mutex<Option<Callback<io::Result<Bytes>>>>,
    shutdown: AtomicBool,
}

impl Endpoint for FuzzEndpoint {
    fn read(&self, on_done: Callback<io::Result<Bytes>>) {
        *self.pending_read.lock() = Some(on_done);
    }

    fn write(&self, _buffers: Vec<Bytes>, on_done: Callback<io::Result<()>>) {
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
        "fuzz".to_string()
    }
}

struct Immediate;

impl Scheduler for Immediate {
    fn run_later(&self, task: Task) {
        task();
    }

    fn run_at(&self, _deadline: Instant, task: Task) {
        task();
    }
}

fuzz_target!(|data: &[u8]| {
    let endpoint = Arc::new(FuzzEndpoint::default());
    let channel_args = ChannelArgs::new()
        .set(args::BDP_PROBE, 0i64)
        .set(args::KEEPALIVE_TIME_MS, args::INFINITE_MS)
        .set(args::MAX_CONCURRENT_STREAMS, 4i64);
    let transport = Transport::new(endpoint.clone(), Arc::new(Immediate), &channel_args, Role::Server);

    // Accept every stream and answer it straight away.
    let t = transport.clone();
    transport.perform_transport_op(TransportOp {
        set_accept_stream: Some(Arc::new(move |data: ServerData| {
            let Ok(stream) = t.init_stream(Some(data)) else {
                return;
            };
            let mut trailers = grpc::Metadata::new();
            trailers.insert("grpc-status", "0");
            t.perform_stream_op(
                &stream,
                StreamOp {
                    send_trailing_metadata: Some(trailers),
                    recv_message: Some(Box::new(|_| {})),
                    ..Default::default()
                },
            );
        })),
        ..Default::default()
    });
    transport.start_reading(None);

    let mut input = Vec::from(http2::CONNECTION_PREFACE);
    input.extend_from_slice(data);
    for chunk in input.chunks(1024) {
        let cb = endpoint.pending_read.lock().take();
        let Some(cb) = cb else {
            break;
        };
        cb(Ok(Bytes::copy_from_slice(chunk)));
    }

    if transport.connectivity_state() == ConnectivityState::Shutdown {
        assert!(endpoint.shutdown.load(Ordering::SeqCst));
    }
    transport.destroy_transport();
});
