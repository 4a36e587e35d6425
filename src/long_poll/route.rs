use std::{
    collections::HashMap, fmt, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration,
};

use bytes::Bytes;
use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use snafu::Snafu;
use tracing::{Instrument, Span};

use super::{
    TransportSettings, instant_now,
    internal_event::{CloseReason, TransportEvents},
    message::{ErrorKind, Message, MessageBuilder, WireError},
    session::{PollError, Session, SessionError},
};

const HANDLER_PANICKED: &str = "handler panicked";

/// How many inbound messages a session hands to its handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RouteKind {
    /// Only the first message; later ones are dropped.
    Oneshot,
    /// Every message, in arrival order.
    Stream,
}

/// Failure reported by a handler. It reaches the client once all pending
/// outbound data has been delivered.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HandlerError {
    #[snafu(display("upstream call failed with code {code}: {message}"))]
    Rpc { code: i32, message: String },

    #[snafu(display("{source}"))]
    Session { source: SessionError },

    #[snafu(display("{source}"))]
    Custom { source: crate::Error },
}

impl HandlerError {
    pub fn rpc(code: i32, message: impl Into<String>) -> Self {
        HandlerError::Rpc {
            code,
            message: message.into(),
        }
    }

    pub fn custom(source: impl Into<crate::Error>) -> Self {
        HandlerError::Custom {
            source: source.into(),
        }
    }

    pub fn to_wire(&self) -> WireError {
        match self {
            HandlerError::Rpc { code, message } => WireError::new(ErrorKind::Rpc, *code, message.clone()),
            HandlerError::Session { source } => WireError::new(ErrorKind::Protocol, 0, source.to_string()),
            HandlerError::Custom { source } => WireError::new(ErrorKind::Unknown, 0, source.to_string()),
        }
    }
}

impl From<SessionError> for HandlerError {
    fn from(source: SessionError) -> Self {
        HandlerError::Session { source }
    }
}

/// Handles a single request; the returned body terminates the session.
pub trait OneshotHandler: Send + Sync + 'static {
    fn call(&self, session: Arc<Session>) -> BoxFuture<'static, Result<Bytes, HandlerError>>;
}

impl<F, Fut> OneshotHandler for F
where
    F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
{
    fn call(&self, session: Arc<Session>) -> BoxFuture<'static, Result<Bytes, HandlerError>> {
        Box::pin(self(session))
    }
}

/// Drives an open-ended exchange through the session's queues.
pub trait StreamHandler: Send + Sync + 'static {
    fn call(&self, session: Arc<Session>) -> BoxFuture<'static, Result<(), HandlerError>>;
}

impl<F, Fut> StreamHandler for F
where
    F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn call(&self, session: Arc<Session>) -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(self(session))
    }
}

#[derive(Clone)]
pub enum RouteHandler {
    Oneshot(Arc<dyn OneshotHandler>),
    Stream(Arc<dyn StreamHandler>),
}

impl RouteHandler {
    pub fn kind(&self) -> RouteKind {
        match self {
            RouteHandler::Oneshot(_) => RouteKind::Oneshot,
            RouteHandler::Stream(_) => RouteKind::Stream,
        }
    }

    async fn run(&self, session: Arc<Session>) -> Result<(), HandlerError> {
        match self {
            RouteHandler::Oneshot(handler) => {
                let body = handler.call(Arc::clone(&session)).await?;
                session.terminate(body).await?;
                Ok(())
            }
            RouteHandler::Stream(handler) => handler.call(session).await,
        }
    }
}

impl fmt::Debug for RouteHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RouteHandler").field(&self.kind()).finish()
    }
}

/// Hook run once per session, before its first poll is answered.
///
/// A route holds one instance of each middleware and every session shares
/// it. Per-session data belongs in [`Session::insert_state`].
pub trait Middleware: Send + Sync + 'static {
    fn on_first_poll(&self, session: &Session, message: &Message);
}

pub struct MiddlewareFn<F>(F);

/// Wraps a closure as a [`Middleware`].
pub fn middleware_fn<F>(f: F) -> MiddlewareFn<F>
where
    F: Fn(&Session, &Message) + Send + Sync + 'static,
{
    MiddlewareFn(f)
}

impl<F> Middleware for MiddlewareFn<F>
where
    F: Fn(&Session, &Message) + Send + Sync + 'static,
{
    fn on_first_poll(&self, session: &Session, message: &Message) {
        (self.0)(session, message)
    }
}

/// Attaches a `session` span to the session; the handler task runs inside it.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingMiddleware;

impl Middleware for TracingMiddleware {
    fn on_first_poll(&self, session: &Session, message: &Message) {
        let span = info_span!(
            target: "long_poll::session",
            "session",
            session_id = %session.id(),
            trace_id = %message.trace_id(),
            route = %session.route_name(),
        );
        session.insert_state(span);
    }
}

/// A route as registered with a [`Router`](super::Router).
pub struct RouteDefinition {
    name: String,
    handler: RouteHandler,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl RouteDefinition {
    pub fn oneshot(name: impl Into<String>, handler: impl OneshotHandler) -> Self {
        Self {
            name: name.into(),
            handler: RouteHandler::Oneshot(Arc::new(handler)),
            middlewares: Vec::new(),
        }
    }

    pub fn stream(name: impl Into<String>, handler: impl StreamHandler) -> Self {
        Self {
            name: name.into(),
            handler: RouteHandler::Stream(Arc::new(handler)),
            middlewares: Vec::new(),
        }
    }

    #[must_use]
    pub fn middleware(mut self, middleware: impl Middleware) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RouteKind {
        self.handler.kind()
    }
}

impl fmt::Debug for RouteDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteDefinition")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}

/// A named handler and the live sessions talking to it.
pub struct Route {
    name: String,
    handler: RouteHandler,
    middlewares: Vec<Arc<dyn Middleware>>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    settings: TransportSettings,
    events: Arc<TransportEvents>,
}

impl Route {
    pub(crate) fn new(
        definition: RouteDefinition,
        settings: TransportSettings,
        events: Arc<TransportEvents>,
    ) -> Self {
        Self {
            name: definition.name,
            handler: definition.handler,
            middlewares: definition.middlewares,
            sessions: Mutex::new(HashMap::new()),
            settings,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RouteKind {
        self.handler.kind()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(id).cloned()
    }

    /// Answers one poll for `message`, creating its session on first
    /// contact.
    pub(crate) async fn poll<C>(&self, message: Message, cancelled: C) -> Result<Message, PollError>
    where
        C: Future<Output = ()>,
    {
        let Some(session) = self.session_for(&message) else {
            // terminate for a session we never saw, or already dropped
            return MessageBuilder::new()
                .trace_id(message.trace_id())
                .session_id(message.session_id())
                .route_name(&self.name)
                .terminated(true)
                .not_ready(true)
                .empty(true)
                .build()
                .map_err(|source| PollError::Response { source });
        };

        let response = session
            .resolve_poll(message, self.settings.get_route_resume_timeout(), cancelled)
            .await;

        if session.is_closed() {
            self.remove(&session);
        }
        response
    }

    fn session_for(&self, message: &Message) -> Option<Arc<Session>> {
        let session = {
            let mut sessions = self.sessions.lock();
            if let Some(session) = sessions.get(message.session_id()) {
                return Some(Arc::clone(session));
            }
            if message.is_terminated() {
                return None;
            }
            let session = Arc::new(Session::new(
                message.session_id().to_owned(),
                message.trace_id().to_owned(),
                self.name.clone(),
                self.kind(),
                self.middlewares.clone(),
                self.settings.session_timings(),
                Arc::clone(&self.events),
            ));
            sessions.insert(session.id().to_owned(), Arc::clone(&session));
            session
        };

        self.events.session_opened.emit(&self.name);
        session.run_middlewares(message);
        self.spawn_handler(Arc::clone(&session));
        Some(session)
    }

    fn spawn_handler(&self, session: Arc<Session>) {
        let handler = self.handler.clone();
        let span = session.state::<Span>().unwrap_or_else(|| {
            debug_span!(
                target: "long_poll::session",
                "session",
                session_id = %session.id(),
                route = %self.name,
            )
        });

        // A closed session drops the handler future at its current await.
        tokio::spawn(
            async move {
                let run = AssertUnwindSafe(handler.run(Arc::clone(&session))).catch_unwind();
                let outcome = tokio::select! {
                    biased;
                    _ = session.closed() => None,
                    result = run => Some(result),
                };
                match outcome {
                    Some(Ok(Ok(()))) => {
                        debug!(target: "long_poll::session", "Handler finished");
                        session.finish(None);
                    }
                    Some(Ok(Err(error))) => session.finish(Some(error.to_wire())),
                    Some(Err(_)) => {
                        error!(target: "long_poll::session", "Handler panicked");
                        session.finish(Some(WireError::new(ErrorKind::Unknown, 0, HANDLER_PANICKED)));
                    }
                    None => debug!(target: "long_poll::session", "Handler stopped by session close"),
                }
            }
            .instrument(span),
        );
    }

    fn remove(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.lock();
        if sessions
            .get(session.id())
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(session.id());
        }
    }

    /// Closes and drops every session that has not been polled for longer
    /// than `stale_after`, along with any already closed. Returns how many
    /// sessions this call closed.
    pub(crate) fn sweep(&self, stale_after: Duration) -> usize {
        let now = instant_now();
        let stale: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| session.is_closed() || session.idle_for(now) > stale_after)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        stale
            .iter()
            .filter(|session| session.close(CloseReason::Collected))
            .count()
    }

    /// Closes and drops every session.
    pub(crate) fn close_all(&self, reason: CloseReason) -> usize {
        let drained: Vec<Arc<Session>> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        drained.iter().filter(|session| session.close(reason)).count()
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}
