//! Bidirectional sessions over plain HTTP long polling.
//!
//! Every request is a `POST` carrying one [`Message`]. The [`Router`] finds
//! the [`Route`] named by the message, which finds or creates the
//! [`Session`] for its session id. The session hands the message to the
//! route's handler task and answers with whatever the handler produced
//! within the route's resume timeout, plus a hint of how long the client
//! should wait before polling again.

mod delay_curve;
pub mod hyper_integration;
pub mod http;
pub mod internal_event;
pub mod message;
mod rate_counter;
pub mod rendezvous;
mod ring_buffer;
pub mod route;
pub mod router;
pub mod session;
mod timings;

use std::time::Duration;

use bon::Builder;

pub use delay_curve::PollDelayCurve;
pub use self::http::RouterError;
pub use hyper_integration::{RouterService, serve};
pub use message::{Encoding, ErrorKind, Message, MessageBuilder, WireError};
pub use rendezvous::RendezvousQueue;
pub use route::{
    HandlerError, Middleware, MiddlewareFn, Route, RouteDefinition, RouteKind, TracingMiddleware,
    middleware_fn,
};
pub use router::Router;
pub use session::{Session, SessionError};
pub use timings::{ObservedRates, SessionTimings, smooth, target_factor};

fn instant_now() -> std::time::Instant {
    tokio::time::Instant::now().into()
}

/// Tuning for a [`Router`] and every session it creates.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `min_client_poll_delay` | 100 ms | Shortest delay hinted to clients |
/// | `max_client_poll_delay` | 5 s | Longest delay hinted to clients, used while idle |
/// | `delay_curve_steepness` | 3.0 | How quickly the hint falls from max to min |
/// | `route_resume_timeout` | 100 ms | How long a poll waits for outbound data; zero never waits |
/// | `garbage_collection_delay` | 10 s | Interval between stale session sweeps; zero disables them |
/// | `session_stale_after` | 60 s | Poll inactivity after which a session is collected |
/// | `trace_id_bytes` | 8 | Random bytes in a generated trace id |
/// | `session_id_bytes` | 16 | Random bytes in a generated session id |
/// | `rate_window` | 16 | Samples kept by each rate counter |
/// | `max_body_bytes` | 4 MiB | Largest accepted request body |
///
/// ```rust
/// use std::time::Duration;
/// use longpoll_transport::long_poll::TransportSettings;
///
/// let settings = TransportSettings::builder()
///     .route_resume_timeout(Duration::from_millis(250))
///     .garbage_collection_delay(Duration::ZERO)
///     .build();
/// assert_eq!(settings.get_route_resume_timeout(), Duration::from_millis(250));
/// ```
#[derive(Clone, Copy, Debug, Builder)]
pub struct TransportSettings {
    #[builder(default = default_min_client_poll_delay())]
    min_client_poll_delay: Duration,

    #[builder(default = default_max_client_poll_delay())]
    max_client_poll_delay: Duration,

    /// Steepness of the negative exponential mapping a pacing factor to a
    /// delay. Non-positive values fall back to `1.0`.
    #[builder(default = default_delay_curve_steepness())]
    delay_curve_steepness: f64,

    /// Longest time a poll blocks waiting for the handler to produce
    /// something. A zero timeout makes polls purely non-blocking checks.
    #[builder(default = default_route_resume_timeout())]
    route_resume_timeout: Duration,

    /// Period of the background sweep. Zero leaves abandoned sessions in
    /// place until the router is shut down, which is occasionally useful in
    /// tests.
    #[builder(default = default_garbage_collection_delay())]
    garbage_collection_delay: Duration,

    #[builder(default = default_session_stale_after())]
    session_stale_after: Duration,

    #[builder(default = default_trace_id_bytes())]
    trace_id_bytes: usize,

    #[builder(default = default_session_id_bytes())]
    session_id_bytes: usize,

    #[builder(default = default_rate_window())]
    rate_window: usize,

    #[builder(default = default_max_body_bytes())]
    max_body_bytes: usize,
}

const fn default_min_client_poll_delay() -> Duration {
    Duration::from_millis(100)
}

const fn default_max_client_poll_delay() -> Duration {
    Duration::from_millis(5000)
}

const fn default_delay_curve_steepness() -> f64 {
    3.0
}

const fn default_route_resume_timeout() -> Duration {
    Duration::from_millis(100)
}

const fn default_garbage_collection_delay() -> Duration {
    Duration::from_secs(10)
}

const fn default_session_stale_after() -> Duration {
    Duration::from_secs(60)
}

const fn default_trace_id_bytes() -> usize {
    8
}

const fn default_session_id_bytes() -> usize {
    16
}

const fn default_rate_window() -> usize {
    16
}

const fn default_max_body_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl TransportSettings {
    pub fn get_min_client_poll_delay(&self) -> Duration {
        self.min_client_poll_delay
    }
    pub fn get_max_client_poll_delay(&self) -> Duration {
        self.max_client_poll_delay
    }
    pub fn get_delay_curve_steepness(&self) -> f64 {
        self.delay_curve_steepness
    }
    pub fn get_route_resume_timeout(&self) -> Duration {
        self.route_resume_timeout
    }
    pub fn get_garbage_collection_delay(&self) -> Duration {
        self.garbage_collection_delay
    }
    pub fn get_session_stale_after(&self) -> Duration {
        self.session_stale_after
    }
    pub fn get_trace_id_bytes(&self) -> usize {
        self.trace_id_bytes
    }
    pub fn get_session_id_bytes(&self) -> usize {
        self.session_id_bytes
    }
    pub fn get_rate_window(&self) -> usize {
        self.rate_window
    }
    pub fn get_max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    pub fn delay_curve(&self) -> PollDelayCurve {
        PollDelayCurve::new(
            self.min_client_poll_delay,
            self.max_client_poll_delay,
            self.delay_curve_steepness,
        )
    }

    /// Fresh controller state for a new session.
    pub fn session_timings(&self) -> SessionTimings {
        SessionTimings::new(self.delay_curve(), self.rate_window)
    }
}
