//! A running duplex session.
//!
//! [`SessionBuilder::connect`] takes the two halves of a byte transport and
//! spawns two tasks: the inbound loop, which decodes and gates every frame,
//! and a notification worker that delivers inbound notifications in arrival
//! order. Outbound traffic goes through [`Session`], which shares one writer
//! between all of its clones.

use lsp_types::{InitializeParams, InitializeResult, InitializedParams};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::lsp::config::SessionConfig;
use crate::lsp::error::Error;
use crate::lsp::framed::{Frame, FrameReader, FrameWriter};
use crate::lsp::handler::{
    IgnoreNotifications, MethodNotFound, NotificationHandler, RequestHandler, Router,
};
use crate::lsp::lifecycle::{Direction, Lifecycle, SessionPhase, Traffic, ViolationKind};
use crate::lsp::message_creator::MessageFactory;
use crate::lsp::message_parser::parse_message_from_slice;
use crate::lsp::pending::{CorrelationTable, PendingHandle};
use crate::lsp::registry::{
    Exit, Initialize, Initialized, MethodRegistry, NotificationMethod, RequestMethod, Shutdown,
};
use crate::lsp::types::{Message, Notification, Request, RequestId, Response, ResponseError};
use crate::lsp::Result;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Configures and starts a [`Session`].
pub struct SessionBuilder {
    registry: Arc<MethodRegistry>,
    config: SessionConfig,
    requests: Arc<dyn RequestHandler>,
    notifications: Arc<dyn NotificationHandler>,
}

impl SessionBuilder {
    pub fn new(registry: impl Into<Arc<MethodRegistry>>) -> Self {
        SessionBuilder {
            registry: registry.into(),
            config: SessionConfig::default(),
            requests: Arc::new(MethodNotFound),
            notifications: Arc::new(IgnoreNotifications),
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn request_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.requests = handler;
        self
    }

    pub fn notification_handler(mut self, handler: Arc<dyn NotificationHandler>) -> Self {
        self.notifications = handler;
        self
    }

    /// Use `router` for both inbound requests and notifications.
    ///
    /// The router must have been built on this builder's registry.
    pub fn router(mut self, router: Router) -> Result<Self> {
        if !Arc::ptr_eq(router.registry(), &self.registry) {
            return Err(Error::RegistryMismatch);
        }
        let router = Arc::new(router);
        let requests: Arc<dyn RequestHandler> = router.clone();
        let notifications: Arc<dyn NotificationHandler> = router;
        self.requests = requests;
        self.notifications = notifications;
        Ok(self)
    }

    /// Start the session over `reader` and `writer`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect<R, W>(self, reader: R, writer: W) -> Session
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let span = info_span!("session", name = %self.config.name);
        let (closed_tx, _) = watch::channel(false);
        let writer: BoxedWriter = Box::new(writer);

        let shared = Arc::new(Shared {
            registry: self.registry,
            factory: MessageFactory::new(),
            pending: CorrelationTable::new(),
            lifecycle: Mutex::new(Lifecycle::new()),
            writer: AsyncMutex::new(Some(FrameWriter::new(writer))),
            requests: self.requests,
            closed_tx,
            torn_down: AtomicBool::new(false),
        });

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver_notifications(self.notifications, notify_rx).instrument(span.clone()));

        let reader = FrameReader::with_config(reader, &self.config);
        tokio::spawn(run_inbound(shared.clone(), reader, notify_tx).instrument(span));

        Session { shared }
    }
}

struct Shared {
    registry: Arc<MethodRegistry>,
    factory: MessageFactory,
    pending: CorrelationTable,
    lifecycle: Mutex<Lifecycle>,
    // Taken and dropped on teardown so the peer sees end of stream.
    writer: AsyncMutex<Option<FrameWriter<BoxedWriter>>>,
    requests: Arc<dyn RequestHandler>,
    closed_tx: watch::Sender<bool>,
    torn_down: AtomicBool,
}

enum Flow {
    Continue,
    Stop,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    fn admit_outgoing(&self, traffic: Traffic<'_>) -> Result<SessionPhase> {
        let admitted = self.lifecycle.lock().admit(Direction::Outgoing, traffic);
        admitted.map_err(|violation| match violation.kind {
            ViolationKind::Exited => Error::ConnectionClosed,
            _ => Error::PhaseViolation(violation),
        })
    }

    /// Admit `traffic` and write `message` while holding the writer, so phase
    /// transitions happen in the same order as frames reach the wire.
    ///
    /// A failed write ends the session. Writing `exit` also ends it, and the
    /// transport is closed before this returns.
    async fn send_gated(
        self: &Arc<Self>,
        traffic: Traffic<'_>,
        message: Message,
    ) -> Result<SessionPhase> {
        let body = message.to_vec().map_err(Error::Serialize)?;

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(Error::ConnectionClosed);
        };
        let phase = self.admit_outgoing(traffic)?;
        trace!(method = ?message.method(), len = body.len(), "sending message");
        if let Err(e) = writer.write_body(&body).await {
            drop(guard);
            warn!(error = %e, "write failed");
            self.teardown("write failed");
            return Err(Error::Io(e));
        }

        if phase == SessionPhase::Exited {
            let writer = guard.take();
            drop(guard);
            self.teardown("exit sent");
            if let Some(writer) = writer {
                close_transport(writer).await;
            }
        }
        Ok(phase)
    }

    /// Write one message as a single frame, bypassing the gate.
    async fn write_message(self: &Arc<Self>, message: &Message) -> Result<()> {
        let body = message.to_vec().map_err(Error::Serialize)?;
        trace!(method = ?message.method(), len = body.len(), "sending message");

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(Error::ConnectionClosed);
        };
        if let Err(e) = writer.write_body(&body).await {
            drop(guard);
            warn!(error = %e, "write failed");
            self.teardown("write failed");
            return Err(Error::Io(e));
        }
        Ok(())
    }

    async fn send_response(
        self: &Arc<Self>,
        method: &str,
        id: RequestId,
        outcome: std::result::Result<Value, ResponseError>,
    ) {
        let response = match outcome {
            Ok(result) => Response::success(id, result),
            Err(error) => Response::failure(id, error),
        };
        let traffic = Traffic::Response {
            method,
            success: response.is_success(),
        };
        let id = response.id.clone();
        if let Err(e) = self.send_gated(traffic, response.into()).await {
            debug!(%id, method, error = %e, "dropping response");
        }
    }

    fn route(
        self: &Arc<Self>,
        frame: Frame,
        notifications: &mpsc::UnboundedSender<Notification>,
    ) -> Flow {
        let message = match parse_message_from_slice(frame.body()) {
            Ok(message) => message,
            Err(e) => {
                warn!(len = frame.len(), error = %e, "dropping undecodable message");
                return Flow::Continue;
            }
        };

        match message {
            Message::Response(response) => {
                self.route_response(response);
                Flow::Continue
            }
            Message::Request(request) => {
                self.route_request(request);
                Flow::Continue
            }
            Message::Notification(notification) => {
                let traffic = Traffic::Notification(&notification.method);
                let admitted = self.lifecycle.lock().admit(Direction::Incoming, traffic);
                let phase = match admitted {
                    Ok(phase) => phase,
                    Err(violation) => {
                        warn!(%violation, "dropping notification");
                        return Flow::Continue;
                    }
                };

                trace!(method = %notification.method, "received notification");
                if notifications.send(notification).is_err() {
                    debug!("notification worker is gone");
                }
                if phase == SessionPhase::Exited {
                    info!("peer sent exit");
                    return Flow::Stop;
                }
                Flow::Continue
            }
        }
    }

    fn route_response(&self, response: Response) {
        let Some(method) = self.pending.method_of(&response.id) else {
            warn!(id = %response.id, "response for unknown request id");
            return;
        };

        let traffic = Traffic::Response {
            method: &method,
            success: response.is_success(),
        };
        let admitted = self.lifecycle.lock().admit(Direction::Incoming, traffic);
        if let Err(violation) = admitted {
            warn!(id = %response.id, %violation, "dropping response");
            return;
        }

        trace!(id = %response.id, %method, "received response");
        if let Err(e) = self.pending.resolve(&response.id, response.outcome) {
            warn!(error = %e, "response could not be delivered");
        }
    }

    fn route_request(self: &Arc<Self>, request: Request) {
        let traffic = Traffic::Request(&request.method);
        let admitted = self.lifecycle.lock().admit(Direction::Incoming, traffic);
        let shared = self.clone();

        match admitted {
            Err(violation) => {
                warn!(id = %request.id, %violation, "rejecting request");
                let response = Response::failure(
                    request.id,
                    ResponseError::invalid_request(violation.to_string()),
                );
                tokio::spawn(
                    async move {
                        if let Err(e) = shared.write_message(&response.into()).await {
                            debug!(error = %e, "failed to send rejection");
                        }
                    }
                    .in_current_span(),
                );
            }
            Ok(_) => {
                trace!(id = %request.id, method = %request.method, "received request");
                tokio::spawn(
                    async move {
                        let Request { id, method, params } = request;
                        let outcome = shared.requests.handle_request(&method, params).await;
                        shared.send_response(&method, id, outcome).await;
                    }
                    .in_current_span(),
                );
            }
        }
    }

    /// Move to `Exited`, fail every pending call and close the transport.
    /// Only the first call has any effect.
    fn teardown(self: &Arc<Self>, reason: &str) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.lifecycle.lock().terminate();
        let failed = self.pending.fail_all();
        self.closed_tx.send_replace(true);
        info!(reason, failed, "session closed");

        let shared = self.clone();
        tokio::spawn(
            async move {
                let writer = shared.writer.lock().await.take();
                if let Some(writer) = writer {
                    close_transport(writer).await;
                }
            }
            .in_current_span(),
        );
    }
}

async fn close_transport(mut writer: FrameWriter<BoxedWriter>) {
    if let Err(e) = writer.close().await {
        debug!(error = %e, "failed to close transport");
    }
}

async fn run_inbound<R>(
    shared: Arc<Shared>,
    mut reader: FrameReader<R>,
    notifications: mpsc::UnboundedSender<Notification>,
) where
    R: AsyncRead + Unpin,
{
    let mut closed = shared.closed_tx.subscribe();
    let reason = loop {
        let frame = tokio::select! {
            _ = closed.wait_for(|closed| *closed) => break "closed locally",
            frame = reader.next_frame() => frame,
        };

        match frame {
            Ok(Some(frame)) => {
                trace!(len = frame.len(), "received frame");
                if let Flow::Stop = shared.route(frame, &notifications) {
                    break "exit received";
                }
            }
            Ok(None) => break "peer closed the connection",
            Err(e) => {
                warn!(error = %e, "framing error");
                break "framing error";
            }
        }
    };
    shared.teardown(reason);
}

async fn deliver_notifications(
    handler: Arc<dyn NotificationHandler>,
    mut queue: mpsc::UnboundedReceiver<Notification>,
) {
    while let Some(notification) = queue.recv().await {
        handler
            .handle_notification(&notification.method, notification.params)
            .await;
    }
}

/// Handle to a running session. Clones share the same connection.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Send a request and return a handle to its eventual result.
    ///
    /// Nothing is written if the method is not registered as `M` or the
    /// current phase does not allow the request.
    pub async fn send_request<M: RequestMethod>(
        &self,
        params: M::Params,
    ) -> Result<PendingHandle<M::Result>> {
        self.ensure_open()?;
        self.shared.registry.expect_request::<M>()?;
        let request = self.shared.factory.create_request::<M>(&params)?;

        // Registered before the write so the response cannot outrun it.
        let id = request.id.clone();
        let handle = self.shared.pending.register::<M::Result>(id.clone(), M::NAME)?;
        debug!(%id, method = M::NAME, "sending request");
        let sent = self
            .shared
            .send_gated(Traffic::Request(M::NAME), request.into())
            .await;
        if let Err(e) = sent {
            self.shared.pending.remove(&id);
            return Err(e);
        }
        Ok(handle)
    }

    /// Send a request and wait for its response.
    pub async fn call<M: RequestMethod>(&self, params: M::Params) -> Result<M::Result> {
        self.send_request::<M>(params).await?.await
    }

    /// Like [`Session::call`], giving up after `timeout`.
    ///
    /// The pending entry is kept, so a late response is still consumed.
    pub async fn call_with_timeout<M: RequestMethod>(
        &self,
        params: M::Params,
        timeout: Duration,
    ) -> Result<M::Result> {
        let handle = self.send_request::<M>(params).await?;
        let id = handle.id().clone();
        let method = handle.method().to_string();
        match tokio::time::timeout(timeout, handle).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%id, %method, ?timeout, "request timed out");
                Err(Error::Timeout { method })
            }
        }
    }

    /// Send a notification.
    ///
    /// Sending `exit` closes the session; the transport is closed by the time
    /// this returns.
    pub async fn notify<M: NotificationMethod>(&self, params: M::Params) -> Result<()> {
        self.ensure_open()?;
        self.shared.registry.expect_notification::<M>()?;
        let notification = self.shared.factory.create_notification::<M>(&params)?;

        debug!(method = M::NAME, "sending notification");
        self.shared
            .send_gated(Traffic::Notification(M::NAME), notification.into())
            .await?;
        Ok(())
    }

    /// Run the `initialize` request and send `initialized`.
    pub async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        let result = self.call::<Initialize>(params).await?;
        self.notify::<Initialized>(InitializedParams {}).await?;
        Ok(result)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.call::<Shutdown>(()).await
    }

    pub async fn exit(&self) -> Result<()> {
        self.notify::<Exit>(()).await
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.lifecycle.lock().phase()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolves once the session has been torn down.
    pub async fn closed(&self) {
        let mut closed = self.shared.closed_tx.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.shared.registry
    }

    /// Number of calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsp::message_parser::parse_message;
    use serde_json::json;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    struct Peer {
        reader: FrameReader<ReadHalf<DuplexStream>>,
        writer: FrameWriter<WriteHalf<DuplexStream>>,
    }

    impl Peer {
        async fn recv(&mut self) -> Value {
            let frame = self.reader.next_frame().await.unwrap().unwrap();
            serde_json::from_slice(frame.body()).unwrap()
        }

        async fn send(&mut self, value: Value) {
            let body = serde_json::to_vec(&value).unwrap();
            self.writer.write_body(&body).await.unwrap();
        }
    }

    fn connect(builder: SessionBuilder) -> (Session, Peer) {
        let (local, remote) = duplex(64 * 1024);
        let (read, write) = split(local);
        let session = builder.connect(read, write);
        let (read, write) = split(remote);
        let peer = Peer {
            reader: FrameReader::new(read),
            writer: FrameWriter::new(write),
        };
        (session, peer)
    }

    #[tokio::test]
    async fn test_shutdown_before_initialize_is_rejected_locally() {
        let (session, mut peer) = connect(SessionBuilder::new(MethodRegistry::lsp()));

        let err = session.shutdown().await.unwrap_err();
        assert!(matches!(err, Error::PhaseViolation(ref v) if v.kind == ViolationKind::NotInitialized));
        assert_eq!(session.phase(), SessionPhase::Uninitialized);

        // The first thing the peer sees is the exit notification.
        session.exit().await.unwrap();
        let message = parse_message(peer.recv().await).unwrap();
        assert_eq!(message.method(), Some("exit"));
    }

    #[tokio::test]
    async fn test_handshake_updates_phase() {
        let (session, mut peer) = connect(SessionBuilder::new(MethodRegistry::lsp()));

        let client = session.clone();
        let init = tokio::spawn(async move { client.initialize(InitializeParams::default()).await });

        let request = peer.recv().await;
        assert_eq!(request["method"], "initialize");
        assert_eq!(session.phase(), SessionPhase::Initializing);
        peer.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"capabilities": {}}}))
            .await;

        init.await.unwrap().unwrap();
        assert_eq!(peer.recv().await["method"], "initialized");
        assert_eq!(session.phase(), SessionPhase::Running);
    }

    #[tokio::test]
    async fn test_failed_initialize_rejects_second_attempt() {
        let (session, mut peer) = connect(SessionBuilder::new(MethodRegistry::lsp()));

        let client = session.clone();
        let init = tokio::spawn(async move { client.initialize(InitializeParams::default()).await });
        let request = peer.recv().await;
        peer.send(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": -32603, "message": "boom"}
        }))
        .await;

        let err = init.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Remote(ref e) if e.message == "boom"));
        assert_eq!(session.phase(), SessionPhase::Initializing);

        let err = session
            .initialize(InitializeParams::default())
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::PhaseViolation(ref v) if v.kind == ViolationKind::AlreadyInitialized)
        );
        assert_eq!(session.pending_calls(), 0);

        // Nothing reached the peer between the failed handshake and exit.
        session.exit().await.unwrap();
        assert_eq!(peer.recv().await["method"], "exit");
    }

    #[tokio::test]
    async fn test_exit_closes_transport_before_returning() {
        let (session, _peer) = connect(SessionBuilder::new(MethodRegistry::lsp()));
        session.exit().await.unwrap();
        assert!(session.is_closed());
        assert!(session.shared.writer.lock().await.is_none());
    }

    #[test]
    fn test_router_must_share_the_session_registry() {
        let registry = Arc::new(MethodRegistry::lsp());
        let router = Router::new(Arc::new(MethodRegistry::lsp()));
        let result = SessionBuilder::new(registry.clone()).router(router);
        assert!(matches!(result, Err(Error::RegistryMismatch)));

        let router = Router::new(registry.clone());
        assert!(SessionBuilder::new(registry).router(router).is_ok());
    }

    #[tokio::test]
    async fn test_unregistered_method_is_not_sent() {
        enum Hover {}
        impl RequestMethod for Hover {
            const NAME: &'static str = "textDocument/hover";
            type Params = Value;
            type Result = Value;
        }

        let (session, _peer) = connect(SessionBuilder::new(MethodRegistry::lsp()));
        let err = session.call::<Hover>(Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::MethodNotRegistered(_)));
        assert_eq!(session.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_closed_resolves_after_peer_disconnects() {
        let (session, peer) = connect(SessionBuilder::new(MethodRegistry::lsp()));
        assert!(!session.is_closed());
        drop(peer);
        session.closed().await;
        assert!(session.is_closed());
        assert_eq!(session.phase(), SessionPhase::Exited);
    }
}
