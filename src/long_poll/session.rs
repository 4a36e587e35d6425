//! One logical conversation between a client and a route's handler.
//!
//! The handler task and the request path meet only here: inbound messages
//! flow through one rendezvous queue, outbound responses through another,
//! and everything else (timings, the handler's outcome, pending cookies,
//! attached state) sits behind a per-session lock.

use std::{
    fmt,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use http::{Extensions, HeaderValue, StatusCode};
use parking_lot::Mutex;
use snafu::{Snafu, ensure};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::{
    instant_now,
    internal_event::{CloseReason, PollCompletedData, PollOutcome, TransportEvents},
    message::{BuildError, Message, MessageBuilder, WireError},
    rendezvous::RendezvousQueue,
    route::{Middleware, RouteKind},
    timings::SessionTimings,
};

/// Returned to handlers that touch a session after it was closed.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("session is closed"))]
    Closed,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PollError {
    #[snafu(display("poll was cancelled by the caller"))]
    PollCancelled,

    #[snafu(display("failed to build poll response: {source}"))]
    Response { source: BuildError },
}

pub struct Session {
    id: String,
    trace_id: String,
    route_name: String,
    kind: RouteKind,
    inbound: RendezvousQueue<Message>,
    outbound: RendezvousQueue<MessageBuilder>,
    closed: CancellationToken,
    finished: CancellationToken,
    state: Mutex<SessionState>,
    events: Arc<TransportEvents>,
}

struct SessionState {
    last_poll: Instant,
    handler_error: Option<WireError>,
    timings: SessionTimings,
    cookies: Vec<HeaderValue>,
    extensions: Extensions,
    inbound_accepted: usize,
    middlewares: Option<Vec<Arc<dyn Middleware>>>,
    close_reason: Option<CloseReason>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        trace_id: String,
        route_name: String,
        kind: RouteKind,
        middlewares: Vec<Arc<dyn Middleware>>,
        timings: SessionTimings,
        events: Arc<TransportEvents>,
    ) -> Self {
        Self {
            id,
            trace_id,
            route_name,
            kind,
            inbound: RendezvousQueue::new(),
            outbound: RendezvousQueue::new(),
            closed: CancellationToken::new(),
            finished: CancellationToken::new(),
            state: Mutex::new(SessionState {
                last_poll: instant_now(),
                handler_error: None,
                timings,
                cookies: Vec::new(),
                extensions: Extensions::new(),
                inbound_accepted: 0,
                middlewares: Some(middlewares),
                close_reason: None,
            }),
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn route_name(&self) -> &str {
        &self.route_name
    }

    pub fn kind(&self) -> RouteKind {
        self.kind
    }

    /// Waits for the next inbound message.
    pub async fn receive(&self) -> Result<Message, SessionError> {
        ensure!(!self.is_closed(), ClosedSnafu);
        self.inbound
            .dequeue(self.closed.cancelled())
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub fn receive_nonblocking(&self) -> Result<Option<Message>, SessionError> {
        ensure!(!self.is_closed(), ClosedSnafu);
        Ok(self.inbound.try_dequeue())
    }

    /// Queues `body` for the client and waits until a poll picks it up.
    pub async fn send(&self, body: impl Into<Bytes>) -> Result<(), SessionError> {
        self.deliver(MessageBuilder::new().body(body)).await
    }

    /// Hands `body` to a poll that is waiting right now. Returns `false`
    /// without queueing anything when no poll is waiting.
    pub fn send_nonblocking(&self, body: impl Into<Bytes>) -> Result<bool, SessionError> {
        ensure!(!self.is_closed(), ClosedSnafu);
        Ok(self
            .outbound
            .try_enqueue(MessageBuilder::new().body(body))
            .is_ok())
    }

    /// Sends a final message; the response carrying it is terminated.
    pub async fn terminate(&self, body: impl Into<Bytes>) -> Result<(), SessionError> {
        self.deliver(MessageBuilder::new().body(body).terminated(true))
            .await
    }

    /// Ends the conversation with an empty body and an explicit HTTP status.
    pub async fn terminate_with_status(&self, status: StatusCode) -> Result<(), SessionError> {
        self.deliver(MessageBuilder::new().terminated(true).status(status))
            .await
    }

    async fn deliver(&self, item: MessageBuilder) -> Result<(), SessionError> {
        ensure!(!self.is_closed(), ClosedSnafu);
        self.outbound
            .enqueue(item, self.closed.cancelled())
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Adds a `Set-Cookie` value to the next response, whatever it carries.
    pub fn set_cookie(&self, cookie: HeaderValue) {
        self.state.lock().cookies.push(cookie);
    }

    /// Attaches typed state to the session, returning the previous value.
    pub fn insert_state<T>(&self, value: T) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.state.lock().extensions.insert(value)
    }

    pub fn state<T>(&self) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.state.lock().extensions.get::<T>().cloned()
    }

    /// Resolves once the session is closed for any reason. Handlers should
    /// treat this as cancellation.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state.lock().last_poll)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.lock().close_reason
    }

    /// Closes the session. Only the first call has any effect.
    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        {
            let mut state = self.state.lock();
            if state.close_reason.is_some() {
                return false;
            }
            state.close_reason = Some(reason);
        }
        self.closed.cancel();
        self.events.session_closed.emit(reason);
        debug!(
            target: "long_poll::session",
            session_id = %self.id,
            route = %self.route_name,
            reason = reason.as_str(),
            "Session closed"
        );
        true
    }

    /// Records the handler's outcome. Pending outbound data is still
    /// delivered before the error.
    pub(crate) fn finish(&self, error: Option<WireError>) {
        let mut state = self.state.lock();
        if let Some(error) = &error {
            warn!(
                target: "long_poll::session",
                session_id = %self.id,
                route = %self.route_name,
                code = error.code,
                message = %error.message,
                "Handler failed"
            );
        }
        state.handler_error = error;
        // Cancelled under the lock so a poll never sees the error without
        // the finished flag.
        self.finished.cancel();
    }

    /// Runs the session's middlewares the first time it is polled.
    pub(crate) fn run_middlewares(&self, message: &Message) {
        let Some(middlewares) = self.state.lock().middlewares.take() else {
            return;
        };
        for middleware in middlewares {
            middleware.on_first_poll(self, message);
        }
    }

    /// Answers one poll.
    ///
    /// The incoming message is handed to the handler (subject to the route
    /// kind), then the oldest outbound item is taken, waiting at most
    /// `timeout` for one. Responses without an item report any handler error
    /// instead; a terminated response with nothing left to deliver closes
    /// the session.
    pub(crate) async fn resolve_poll<C>(
        &self,
        message: Message,
        timeout: Duration,
        cancelled: C,
    ) -> Result<Message, PollError>
    where
        C: Future<Output = ()>,
    {
        self.run_middlewares(&message);

        {
            let now = instant_now();
            let mut state = self.state.lock();
            state.last_poll = now;
            state.timings.record_inbound(now, message.has_payload());
        }

        if message.is_terminated() {
            self.close(CloseReason::Client);
        }
        if self.is_closed() {
            return self.closed_response();
        }

        self.accept_inbound(message);

        let finished_before = self.is_finished();
        let item = if timeout.is_zero() {
            self.outbound.try_dequeue()
        } else {
            let wake = async {
                tokio::select! {
                    _ = self.closed.cancelled() => {}
                    _ = self.finished.cancelled() => {}
                }
            };
            tokio::pin!(cancelled);
            tokio::select! {
                biased;
                _ = &mut cancelled => return PollCancelledSnafu.fail(),
                dequeued = tokio::time::timeout(timeout, self.outbound.dequeue(wake)) => {
                    dequeued.ok().and_then(Result::ok)
                }
            }
        };

        self.respond(item, finished_before)
    }

    fn accept_inbound(&self, message: Message) {
        if message.is_not_ready() {
            return;
        }
        {
            let mut state = self.state.lock();
            if self.kind == RouteKind::Oneshot && state.inbound_accepted > 0 {
                trace!(
                    target: "long_poll::session",
                    session_id = %self.id,
                    "Oneshot session already has its request, dropping message"
                );
                return;
            }
            state.inbound_accepted += 1;
        }
        self.inbound.push(message);
    }

    fn respond(
        &self,
        item: Option<MessageBuilder>,
        finished_before: bool,
    ) -> Result<Message, PollError> {
        let now = instant_now();
        let delivered = item.is_some();
        let terminal_item = item.as_ref().is_some_and(MessageBuilder::is_terminated);

        // Closed while this poll waited: closing is final.
        let closed = self.is_closed();
        let mut state = self.state.lock();
        let (builder, error, is_terminated) = match item {
            Some(item) => (item, None, closed || finished_before || terminal_item),
            None => (
                MessageBuilder::new(),
                state.handler_error.take(),
                closed || self.is_finished(),
            ),
        };

        state
            .timings
            .record_outbound(now, !builder.get_body().is_empty());
        let delay = state.timings.next_delay(now, !self.outbound.is_empty());
        let factor = state.timings.factor();
        let cookies = std::mem::take(&mut state.cookies);
        drop(state);

        let mut builder = builder
            .trace_id(&self.trace_id)
            .session_id(&self.id)
            .route_name(&self.route_name)
            .terminated(is_terminated)
            .not_ready(!delivered)
            .empty(!delivered)
            .cookies(cookies)
            .poll_delay_ms(u32::try_from(delay.as_millis()).unwrap_or(u32::MAX));
        if let Some(error) = error {
            builder = builder.error(error);
        }
        let response = builder.build().map_err(|source| PollError::Response { source })?;

        let outcome = if is_terminated {
            PollOutcome::Terminated
        } else if delivered {
            PollOutcome::Delivered
        } else {
            PollOutcome::NotReady
        };
        self.events.poll_completed.emit(PollCompletedData {
            outcome,
            delay,
            factor,
        });

        if is_terminated && (!delivered || (terminal_item && self.outbound.is_empty())) {
            self.close(CloseReason::Handler);
        }
        Ok(response)
    }

    fn closed_response(&self) -> Result<Message, PollError> {
        self.events.poll_completed.emit(PollCompletedData {
            outcome: PollOutcome::Terminated,
            delay: Duration::ZERO,
            factor: 0.0,
        });
        MessageBuilder::new()
            .trace_id(&self.trace_id)
            .session_id(&self.id)
            .route_name(&self.route_name)
            .terminated(true)
            .not_ready(true)
            .empty(true)
            .build()
            .map_err(|source| PollError::Response { source })
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("trace_id", &self.trace_id)
            .field("route_name", &self.route_name)
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}
