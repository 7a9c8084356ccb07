//! The surface the channel and call layers drive.

use crate::args::{ChannelArgs, Role, TransportConfig};
use crate::barrier::Callback;
use crate::combiner::Combiner;
use crate::connectivity::{ConnectivityState, Watcher};
use crate::endpoint::{Endpoint, Scheduler};
use crate::error::Error;
use crate::stream::{RecvInitialMetadata, RecvMessage, RecvTrailingMetadata, Stream, StreamKey};
use crate::transport::TransportState;
use bytes::Bytes;
use grpc::{Code, Metadata};
use std::fmt;
use std::sync::Arc;

/// Called with each stream a client opens on a server transport.
pub type AcceptStream = Arc<dyn Fn(ServerData) + Send + Sync>;

pub(crate) struct Shared {
    pub combiner: Combiner<TransportState>,
    peer: String,
}

/// One HTTP/2 connection. Cheap to clone; every clone drives the same
/// connection.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").field("peer", &self.shared.peer).finish()
    }
}

impl Transport {
    /// Wrap `endpoint`. The client preface and initial SETTINGS are queued
    /// immediately; reading starts with [`Transport::start_reading`].
    pub fn new(
        endpoint: Arc<dyn Endpoint>,
        scheduler: Arc<dyn Scheduler>,
        args: &ChannelArgs,
        role: Role,
    ) -> Self {
        let config = TransportConfig::from_args(args, role);
        let peer = endpoint.peer();
        let shared = Arc::new_cyclic(|this| Shared {
            combiner: Combiner::new(TransportState::new(
                this.clone(),
                endpoint,
                scheduler,
                config,
                role,
            )),
            peer,
        });
        let transport = Self { shared };
        transport.run(|t| {
            t.initiate_write(false, "initial_write");
            t.start_keepalive();
        });
        transport
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn run(&self, action: impl FnOnce(&mut TransportState) + Send + 'static) {
        self.shared.combiner.run(Box::new(action));
    }

    /// Begin reading, parsing `initial` first if the connection already
    /// received bytes (for example during a handshake).
    pub fn start_reading(&self, initial: Option<Bytes>) {
        self.run(move |t| t.start_reading(initial));
    }

    /// Create a stream. Clients pass `None`; servers pass the value handed
    /// to their accept callback.
    pub fn init_stream(&self, server_data: Option<ServerData>) -> Result<StreamHandle, Error> {
        match server_data {
            Some(ServerData(handle)) => {
                if !Arc::ptr_eq(&handle.transport.shared, &self.shared) {
                    return Err(Error::new("Stream belongs to another transport")
                        .with_code(Code::Internal));
                }
                Ok(handle)
            }
            None => {
                let key = self.shared.combiner.with_state(|t| {
                    if !t.role.is_client() {
                        return Err(Error::new("Server transports only accept streams")
                            .with_code(Code::Internal));
                    }
                    if let Some(error) = &t.closed {
                        return Err(error.clone());
                    }
                    Ok(t.streams.insert(Stream::new()))
                })?;
                Ok(StreamHandle::new(self.clone(), key))
            }
        }
    }

    pub fn perform_stream_op(&self, stream: &StreamHandle, op: StreamOp) {
        debug_assert!(Arc::ptr_eq(&stream.transport.shared, &self.shared));
        let key = stream.key;
        stream.transport.run(move |t| t.perform_stream_op(key, op));
    }

    pub fn perform_transport_op(&self, op: TransportOp) {
        self.run(move |t| t.perform_transport_op(op));
    }

    /// Release a stream. A stream still open is cancelled.
    pub fn destroy_stream(&self, stream: StreamHandle) {
        drop(stream);
    }

    /// Close the connection. Every open stream fails.
    pub fn destroy_transport(&self) {
        self.run(|t| {
            t.drop_connection(Error::new("Transport destroyed").with_code(Code::Unavailable))
        });
    }

    pub fn get_peer(&self) -> &str {
        &self.shared.peer
    }

    pub fn connectivity_state(&self) -> ConnectivityState {
        self.shared.combiner.with_state(|t| t.connectivity.state())
    }

    /// Streams currently holding a wire id.
    pub fn stream_count(&self) -> usize {
        self.shared.combiner.with_state(|t| t.stream_table.len())
    }
}

/// Reference to one stream. Dropping it releases the stream, cancelling it
/// if it is still open.
pub struct StreamHandle {
    transport: Transport,
    key: StreamKey,
}

impl StreamHandle {
    pub(crate) fn new(transport: Transport, key: StreamKey) -> Self {
        Self { transport, key }
    }

    /// Wire id, or zero while a client stream waits for one.
    pub fn id(&self) -> u32 {
        let key = self.key;
        self.transport
            .shared
            .combiner
            .with_state(|t| t.streams.get(key).map_or(0, |s| s.id))
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle").field("key", &self.key).finish()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        let key = self.key;
        self.transport.run(move |t| t.destroy_stream(key));
    }
}

/// A stream the peer opened, waiting for [`Transport::init_stream`].
#[derive(Debug)]
pub struct ServerData(StreamHandle);

impl ServerData {
    pub(crate) fn new(handle: StreamHandle) -> Self {
        Self(handle)
    }
}

/// A batch of operations on one stream. Send operations complete through
/// `on_complete` once all of them are written (or failed); receive
/// operations each have their own callback.
#[derive(Default)]
pub struct StreamOp {
    pub send_initial_metadata: Option<Metadata>,
    pub send_message: Option<Bytes>,
    pub send_trailing_metadata: Option<Metadata>,
    pub recv_initial_metadata: Option<RecvInitialMetadata>,
    pub recv_message: Option<RecvMessage>,
    pub recv_trailing_metadata: Option<RecvTrailingMetadata>,
    /// Cancel the stream before anything else in this batch.
    pub cancel: Option<Error>,
    pub on_complete: Option<Callback<Result<(), Error>>>,
}

/// Connection-level operations.
#[derive(Default)]
pub struct TransportOp {
    /// Send GOAWAY; streams the peer opens later are refused.
    pub goaway: Option<Error>,
    pub send_ping: Option<Callback<Result<(), Error>>>,
    /// Call the watcher once the state differs from the one given.
    pub watch_connectivity: Option<(ConnectivityState, Watcher)>,
    pub bind_scheduler: Option<Arc<dyn Scheduler>>,
    pub disconnect_with_error: Option<Error>,
    pub set_accept_stream: Option<AcceptStream>,
    /// Called once the op has been applied.
    pub on_consumed: Option<Callback<()>>,
}
