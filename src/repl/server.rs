//! Replication server: accept loop and per-connection request handling.
//!
//! Each connection runs a reader thread that decodes frames into requests and
//! a handler loop that answers them in order. Long polls block the handler;
//! shutdown cancels every in-flight request through a shared token.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::Sender;
use thiserror::Error;

use crate::core::{ErrorCode, ErrorPayload, Limits, LimitsError};
use crate::metrics;

use super::ack_manager::AckManager;
use super::cancel::{CancelToken, RequestContext};
use super::frame::{FrameError, FrameReader, FrameWriter};
use super::proto::{
    GetMessages, GetTask, ProtoEncodeError, ReplEnvelope, ReplMessage, decode_envelope,
    encode_envelope,
};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);
const HANDLER_TICK: Duration = Duration::from_millis(50);
const OVERLOAD_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct ReplicationServerConfig {
    pub listen_addr: String,
    pub limits: Limits,
    pub max_connections: NonZeroUsize,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Limits(#[from] LimitsError),
}

pub struct ReplicationServer<A> {
    manager: Arc<A>,
    config: ReplicationServerConfig,
}

pub struct ReplicationServerHandle {
    shutdown: Arc<AtomicBool>,
    cancel: CancelToken,
    join: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl ReplicationServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, cancels in-flight polls and waits for the accept loop.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.cancel.cancel();
        let _ = self.join.join();
        tracing::info!(addr = %self.local_addr, "replication server stopped");
    }
}

impl<A> ReplicationServer<A>
where
    A: AckManager + 'static,
{
    pub fn new(manager: Arc<A>, config: ReplicationServerConfig) -> Self {
        Self { manager, config }
    }

    pub fn start(self) -> Result<ReplicationServerHandle, ServerError> {
        self.config.limits.validate()?;
        let listener = TcpListener::bind(&self.config.listen_addr)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let cancel = CancelToken::new();
        let runtime = ServerRuntime {
            manager: self.manager,
            limits: self.config.limits,
            max_connections: self.config.max_connections,
            shutdown: Arc::clone(&shutdown),
            cancel: cancel.clone(),
            active_connections: Arc::new(AtomicUsize::new(0)),
        };

        tracing::info!(
            addr = %local_addr,
            max_connections = runtime.max_connections.get(),
            "replication server listening"
        );
        let join = thread::spawn(move || run_accept_loop(listener, runtime));

        Ok(ReplicationServerHandle {
            shutdown,
            cancel,
            join,
            local_addr,
        })
    }
}

struct ServerRuntime<A> {
    manager: Arc<A>,
    limits: Limits,
    max_connections: NonZeroUsize,
    shutdown: Arc<AtomicBool>,
    cancel: CancelToken,
    active_connections: Arc<AtomicUsize>,
}

impl<A> Clone for ServerRuntime<A> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            limits: self.limits.clone(),
            max_connections: self.max_connections,
            shutdown: Arc::clone(&self.shutdown),
            cancel: self.cancel.clone(),
            active_connections: Arc::clone(&self.active_connections),
        }
    }
}

#[derive(Debug, Error)]
enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("encode error: {0}")]
    Encode(#[from] ProtoEncodeError),
}

enum Inbound {
    Request(ReplMessage),
    /// Frame was intact but its body could not be decoded.
    Invalid(ErrorPayload),
    Terminated { payload: Option<ErrorPayload> },
}

struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn try_acquire(active: &Arc<AtomicUsize>, max: NonZeroUsize) -> Option<Self> {
        let mut current = active.load(Ordering::Acquire);
        loop {
            if current >= max.get() {
                return None;
            }
            match active.compare_exchange(
                current,
                current.saturating_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    metrics::set_repl_connections(current + 1);
                    return Some(Self {
                        active: Arc::clone(active),
                    });
                }
                Err(next) => current = next,
            }
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "active connection counter underflow");
        metrics::set_repl_connections(prev.saturating_sub(1));
    }
}

fn run_accept_loop<A>(listener: TcpListener, runtime: ServerRuntime<A>)
where
    A: AckManager + 'static,
{
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    loop {
        if runtime.shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                match ConnectionGuard::try_acquire(
                    &runtime.active_connections,
                    runtime.max_connections,
                ) {
                    Some(guard) => {
                        tracing::debug!(%peer, "replication connection accepted");
                        let runtime = runtime.clone();
                        workers.push(thread::spawn(move || {
                            if let Err(err) = run_connection(stream, runtime, guard) {
                                tracing::warn!(%peer, "replication connection error: {err}");
                            }
                        }));
                    }
                    None => {
                        tracing::warn!(%peer, "replication connection limit reached");
                        metrics::repl_connection_rejected();
                        // The reply drains the peer's first request, which can
                        // take a while; keep accepting meanwhile.
                        let limits = runtime.limits.clone();
                        thread::spawn(move || send_overloaded(stream, &limits));
                    }
                }
                workers.retain(|worker| !worker.is_finished());
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) => {
                tracing::warn!("replication accept error: {err}");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }

    for worker in workers {
        let _ = worker.join();
    }
}

fn send_overloaded(stream: TcpStream, limits: &Limits) {
    let payload = ErrorPayload::new(
        ErrorCode::Overloaded,
        "replication connection limit reached",
        true,
    );
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_nodelay(true);
    let Ok(reader_stream) = stream.try_clone() else {
        return;
    };
    let mut writer = FrameWriter::new(stream, limits.max_frame_bytes);
    if send_message(&mut writer, ReplMessage::Error(payload)).is_err() {
        return;
    }
    // Consume the peer's first request so closing does not reset the
    // connection before it reads the error.
    let _ = reader_stream.set_read_timeout(Some(OVERLOAD_DRAIN_TIMEOUT));
    let _ = FrameReader::new(reader_stream, limits.max_frame_bytes).read_next();
    writer.shutdown();
}

fn run_connection<A>(
    stream: TcpStream,
    runtime: ServerRuntime<A>,
    _guard: ConnectionGuard,
) -> Result<(), ConnectionError>
where
    A: AckManager + 'static,
{
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let reader_stream = stream.try_clone()?;
    let mut writer = FrameWriter::new(stream, runtime.limits.max_frame_bytes);

    // Cancelled by server shutdown or by the peer going away, so a long
    // poll never holds the connection slot for a departed client.
    let (conn_cancel, _link) = runtime.cancel.child();

    let (inbound_tx, inbound_rx) = crossbeam::channel::unbounded::<Inbound>();
    let reader_limits = runtime.limits.clone();
    let reader_cancel = conn_cancel.clone();
    let reader_handle = thread::spawn(move || {
        let mut reader = FrameReader::new(reader_stream, reader_limits.max_frame_bytes);
        run_reader_loop(&mut reader, inbound_tx, &reader_limits, &reader_cancel);
    });

    let result = serve_requests(&mut writer, &inbound_rx, &runtime, &conn_cancel);
    writer.shutdown();
    let _ = reader_handle.join();
    result
}

fn serve_requests<A>(
    writer: &mut FrameWriter<TcpStream>,
    inbound_rx: &crossbeam::channel::Receiver<Inbound>,
    runtime: &ServerRuntime<A>,
    cancel: &CancelToken,
) -> Result<(), ConnectionError>
where
    A: AckManager + 'static,
{
    loop {
        if runtime.shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }

        let tick = crossbeam::channel::after(HANDLER_TICK);
        crossbeam::select! {
            recv(inbound_rx) -> msg => {
                let Ok(msg) = msg else {
                    return Ok(());
                };
                match msg {
                    Inbound::Request(request) => {
                        let response = handle_request(runtime, cancel, request);
                        if cancel.is_cancelled() && !runtime.shutdown.load(Ordering::Relaxed) {
                            // Peer is gone; nobody is left to read the answer.
                            return Ok(());
                        }
                        send_response(writer, response)?;
                    }
                    Inbound::Invalid(payload) => {
                        send_message(writer, ReplMessage::Error(payload))?;
                    }
                    Inbound::Terminated { payload } => {
                        if let Some(payload) = payload {
                            send_message(writer, ReplMessage::Error(payload))?;
                        }
                        return Ok(());
                    }
                }
            }
            recv(tick) -> _ => {}
        }
    }
}

fn run_reader_loop(
    reader: &mut FrameReader<TcpStream>,
    inbound_tx: Sender<Inbound>,
    limits: &Limits,
    cancel: &CancelToken,
) {
    loop {
        let inbound = match reader.read_next() {
            Ok(Some(bytes)) => match decode_envelope(&bytes, limits) {
                Ok(envelope) => Inbound::Request(envelope.message),
                Err(err) => {
                    tracing::debug!("rejecting undecodable request: {err}");
                    Inbound::Invalid(err.as_error_payload())
                }
            },
            Ok(None) => Inbound::Terminated { payload: None },
            Err(err) => Inbound::Terminated {
                payload: err.as_error_payload(),
            },
        };
        let terminal = matches!(inbound, Inbound::Terminated { .. });
        if terminal {
            cancel.cancel();
        }
        if inbound_tx.send(inbound).is_err() || terminal {
            return;
        }
    }
}

fn handle_request<A: AckManager>(
    runtime: &ServerRuntime<A>,
    cancel: &CancelToken,
    request: ReplMessage,
) -> ReplMessage {
    match request {
        ReplMessage::GetMessages(GetMessages {
            polling_cluster,
            last_retrieved_message_id,
            wait_timeout_ms,
        }) => {
            let ctx = request_context(&runtime.limits, cancel, wait_timeout_ms);
            match runtime
                .manager
                .get_tasks(&ctx, &polling_cluster, last_retrieved_message_id)
            {
                Ok(messages) => ReplMessage::Messages(messages),
                Err(err) => {
                    tracing::debug!(
                        polling_cluster = %polling_cluster,
                        last_retrieved = %last_retrieved_message_id,
                        "get_tasks failed: {err}"
                    );
                    ReplMessage::Error(err.as_error_payload())
                }
            }
        }
        ReplMessage::GetTask(GetTask { descriptor }) => {
            let ctx = request_context(&runtime.limits, cancel, None);
            match runtime.manager.get_task(&ctx, &descriptor) {
                Ok(task) => ReplMessage::Task(task),
                Err(err) => {
                    tracing::debug!(task_id = %descriptor.task_id, "get_task failed: {err}");
                    ReplMessage::Error(err.as_error_payload())
                }
            }
        }
        ReplMessage::Messages(_) | ReplMessage::Task(_) | ReplMessage::Error(_) => {
            ReplMessage::Error(ErrorPayload::new(
                ErrorCode::InvalidRequest,
                "expected GET_MESSAGES or GET_TASK",
                false,
            ))
        }
    }
}

fn request_context(
    limits: &Limits,
    cancel: &CancelToken,
    wait_timeout_ms: Option<u64>,
) -> RequestContext {
    let cap = limits.max_request_wait_ms;
    let wait_ms = wait_timeout_ms.map_or(cap, |wait| wait.min(cap));
    RequestContext::new()
        .with_cancel(cancel.clone())
        .with_timeout(Duration::from_millis(wait_ms))
}

/// Sends a response, degrading to an error frame when it exceeds the frame cap.
fn send_response(
    writer: &mut FrameWriter<TcpStream>,
    response: ReplMessage,
) -> Result<(), ConnectionError> {
    match send_message(writer, response) {
        Err(ConnectionError::Frame(err @ FrameError::TooLarge { .. })) => {
            tracing::warn!("response dropped: {err}");
            let payload = err
                .as_error_payload()
                .unwrap_or_else(|| ErrorPayload::new(ErrorCode::Internal, err.to_string(), false));
            send_message(writer, ReplMessage::Error(payload))
        }
        other => other,
    }
}

fn send_message(
    writer: &mut FrameWriter<TcpStream>,
    message: ReplMessage,
) -> Result<(), ConnectionError> {
    let bytes = encode_envelope(&ReplEnvelope::v1(message))?;
    writer.write_frame(&bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_guard_enforces_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let max = NonZeroUsize::new(2).unwrap();
        let first = ConnectionGuard::try_acquire(&active, max).unwrap();
        let second = ConnectionGuard::try_acquire(&active, max).unwrap();
        assert!(ConnectionGuard::try_acquire(&active, max).is_none());
        drop(first);
        assert_eq!(active.load(Ordering::Acquire), 1);
        let third = ConnectionGuard::try_acquire(&active, max);
        assert!(third.is_some());
        drop(second);
        drop(third);
        assert_eq!(active.load(Ordering::Acquire), 0);
    }

    #[test]
    fn request_wait_is_capped() {
        let limits = Limits {
            max_request_wait_ms: 1_000,
            ..Limits::default()
        };
        let server_cancel = CancelToken::new();
        let (conn_cancel, _link) = server_cancel.child();

        let now = std::time::Instant::now();
        let capped = request_context(&limits, &conn_cancel, Some(60_000));
        assert!(capped.deadline().unwrap() <= now + Duration::from_millis(1_500));

        let short = request_context(&limits, &conn_cancel, Some(10));
        assert!(short.deadline().unwrap() <= now + Duration::from_millis(500));

        server_cancel.cancel();
        assert!(request_context(&limits, &conn_cancel, None).is_cancelled());
    }

    #[test]
    fn reader_eof_cancels_connection_token() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        drop(peer);

        let server_cancel = CancelToken::new();
        let (conn_cancel, _link) = server_cancel.child();
        let (tx, rx) = crossbeam::channel::unbounded();
        let mut reader = FrameReader::new(server_side, Limits::default().max_frame_bytes);
        run_reader_loop(&mut reader, tx, &Limits::default(), &conn_cancel);

        assert!(conn_cancel.is_cancelled());
        assert!(!server_cancel.is_cancelled());
        assert!(matches!(
            rx.try_recv(),
            Ok(Inbound::Terminated { payload: None })
        ));
    }

    #[test]
    fn unexpected_request_type_is_rejected() {
        use crate::core::ReplicationMessages;
        use crate::core::TaskId;
        use crate::test_harness::FakeAckManager;

        let runtime = ServerRuntime {
            manager: Arc::new(FakeAckManager::new()),
            limits: Limits::default(),
            max_connections: NonZeroUsize::new(1).unwrap(),
            shutdown: Arc::new(AtomicBool::new(false)),
            cancel: CancelToken::new(),
            active_connections: Arc::new(AtomicUsize::new(0)),
        };
        let response = handle_request(
            &runtime,
            &CancelToken::new(),
            ReplMessage::Messages(ReplicationMessages::empty(TaskId::ZERO)),
        );
        assert!(matches!(
            response,
            ReplMessage::Error(ErrorPayload {
                code: ErrorCode::InvalidRequest,
                ..
            })
        ));
    }
}
