use std::time::Duration;

use metrics::{Counter, Histogram, counter, histogram};

use crate::registered_event;

/// Why a session left its route's table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The client sent a terminate message.
    Client,
    /// The handler finished and its last response was delivered.
    Handler,
    /// No poll arrived within the staleness window.
    Collected,
    /// The router was shut down.
    Shutdown,
}

impl CloseReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            CloseReason::Client => "client",
            CloseReason::Handler => "handler",
            CloseReason::Collected => "collected",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// What a poll response carried back to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Delivered,
    NotReady,
    Terminated,
}

#[derive(Clone, Copy, Debug)]
pub struct PollCompletedData {
    pub outcome: PollOutcome,
    pub delay: Duration,
    pub factor: f64,
}

registered_event! {
    SessionOpened => {
        opened: Counter = counter!("longpoll_sessions_opened_total"),
    }

    fn emit(&self, route: &str) {
        self.opened.increment(1);
        tracing::debug!(target: "long_poll::session", route, "Session opened");
    }
}

registered_event! {
    SessionClosed => {
        client: Counter = counter!("longpoll_sessions_closed_total", "reason" => "client"),
        handler: Counter = counter!("longpoll_sessions_closed_total", "reason" => "handler"),
        collected: Counter = counter!("longpoll_sessions_closed_total", "reason" => "collected"),
        shutdown: Counter = counter!("longpoll_sessions_closed_total", "reason" => "shutdown"),
    }

    fn emit(&self, reason: CloseReason) {
        match reason {
            CloseReason::Client => self.client.increment(1),
            CloseReason::Handler => self.handler.increment(1),
            CloseReason::Collected => self.collected.increment(1),
            CloseReason::Shutdown => self.shutdown.increment(1),
        }
    }
}

registered_event! {
    PollCompleted => {
        delivered: Counter = counter!("longpoll_polls_total", "outcome" => "delivered"),
        not_ready: Counter = counter!("longpoll_polls_total", "outcome" => "not_ready"),
        terminated: Counter = counter!("longpoll_polls_total", "outcome" => "terminated"),
        // Histogram rather than gauge: every session reports its own hint.
        delay: Histogram = histogram!("longpoll_poll_delay_ms"),
    }

    fn emit(&self, data: PollCompletedData) {
        match data.outcome {
            PollOutcome::Delivered => self.delivered.increment(1),
            PollOutcome::NotReady => self.not_ready.increment(1),
            PollOutcome::Terminated => self.terminated.increment(1),
        }
        let delay_ms = data.delay.as_secs_f64() * 1000.0;
        self.delay.record(delay_ms);

        tracing::trace!(
            target: "long_poll::delay",
            outcome = ?data.outcome,
            delay_ms,
            factor = data.factor,
            "Poll delay hinted"
        );
    }
}

registered_event! {
    SessionsSwept => {
        swept: Histogram = histogram!("longpoll_sessions_swept"),
    }

    fn emit(&self, count: usize) {
        self.swept.record(count as f64);
        if count > 0 {
            tracing::debug!(target: "long_poll::gc", swept = count, "Stale sessions collected");
        }
    }
}

/// Every event handle a router and its sessions report through.
#[derive(Clone, Debug)]
pub struct TransportEvents {
    pub session_opened: SessionOpened,
    pub session_closed: SessionClosed,
    pub poll_completed: PollCompleted,
    pub sessions_swept: SessionsSwept,
}

impl TransportEvents {
    pub fn register() -> Self {
        Self {
            session_opened: SessionOpened::register(),
            session_closed: SessionClosed::register(),
            poll_completed: PollCompleted::register(),
            sessions_swept: SessionsSwept::register(),
        }
    }
}
