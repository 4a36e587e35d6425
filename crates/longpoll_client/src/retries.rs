use std::{
    borrow::Cow,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::FutureExt;
use http::StatusCode;
use longpoll_transport::long_poll::Message;
use tokio::time::{Sleep, sleep};
use tower::retry::Policy;

use crate::transport::ClientError;

/// Verdict of a [`RetryLogic`] on one attempt.
pub enum RetryAction {
    Retry(Cow<'static, str>),
    DontRetry(Cow<'static, str>),
    /// The attempt succeeded.
    Successful,
}

pub trait RetryLogic: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;
    type Request: Clone;
    type Response;

    /// Decides which `Err` results of the inner service are worth another
    /// attempt.
    fn is_retriable_error(&self, error: &Self::Error) -> bool;

    /// Like [`is_retriable_error`](Self::is_retriable_error), for a failure
    /// of `request` in particular.
    fn should_retry_error(&self, _request: &Self::Request, error: &Self::Error) -> bool {
        self.is_retriable_error(error)
    }

    /// Inspects an `Ok` result for failures the transport reported as
    /// success.
    fn should_retry_response(&self, _response: &Self::Response) -> RetryAction {
        RetryAction::Successful
    }
}

/// Randomisation applied to each backoff delay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JitterMode {
    None,

    /// Waits a uniformly random fraction of the computed delay, so clients
    /// cut off together do not reconnect together.
    #[default]
    Full,
}

/// Delays of `factor * base^n` milliseconds for the `n`-th retry, counting
/// from one, optionally capped.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: u64,
    base: u64,
    factor: u64,
    max_delay: Option<Duration>,
}

impl ExponentialBackoff {
    pub const fn from_millis(base: u64) -> ExponentialBackoff {
        ExponentialBackoff {
            current: base,
            base,
            factor: 1u64,
            max_delay: None,
        }
    }

    /// Defaults to `1`.
    pub const fn factor(mut self, factor: u64) -> ExponentialBackoff {
        self.factor = factor;
        self
    }

    /// No delay will be longer than `duration`.
    pub const fn max_delay(mut self, duration: Duration) -> ExponentialBackoff {
        self.max_delay = Some(duration);
        self
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let duration = match self.current.checked_mul(self.factor) {
            Some(duration) => Duration::from_millis(duration),
            None => Duration::from_millis(u64::MAX),
        };

        if let Some(max_delay) = self.max_delay {
            if duration > max_delay {
                return Some(max_delay);
            }
        }

        self.current = self.current.checked_mul(self.base).unwrap_or(u64::MAX);
        Some(duration)
    }
}

#[derive(Clone, Debug)]
pub struct ExponentialBackoffPolicy<L: RetryLogic> {
    attempts_remaining: usize,
    backoff: ExponentialBackoff,
    logic: L,
    jitter_mode: JitterMode,
}

pub struct ExponentialPolicyFuture<L: RetryLogic> {
    delay: Pin<Box<Sleep>>,
    policy: ExponentialBackoffPolicy<L>,
}

impl<L: RetryLogic> ExponentialBackoffPolicy<L> {
    pub fn new(
        max_attempts: usize,
        backoff: ExponentialBackoff,
        logic: L,
        jitter_mode: JitterMode,
    ) -> Self {
        Self {
            attempts_remaining: max_attempts,
            backoff,
            logic,
            jitter_mode,
        }
    }

    pub fn attempts_remaining(&self) -> usize {
        self.attempts_remaining
    }

    fn apply_jitter(&self, base: Duration) -> Duration {
        match self.jitter_mode {
            JitterMode::None => base,
            JitterMode::Full => {
                if base.is_zero() {
                    return Duration::ZERO;
                }
                base.mul_f64(rand::random::<f64>())
            }
        }
    }
}

impl<L: RetryLogic> Policy<L::Request, L::Response, L::Error> for ExponentialBackoffPolicy<L> {
    type Future = ExponentialPolicyFuture<L>;

    fn retry(
        &self,
        request: &L::Request,
        result: Result<&L::Response, &L::Error>,
    ) -> Option<Self::Future> {
        let action = match result {
            Ok(response) => self.logic.should_retry_response(response),
            Err(error) if self.logic.should_retry_error(request, error) => {
                RetryAction::Retry(Cow::Owned(error.to_string()))
            }
            Err(error) => RetryAction::DontRetry(Cow::Owned(error.to_string())),
        };

        match action {
            RetryAction::Retry(reason) => {
                if self.attempts_remaining == 0 {
                    error!(target: "longpoll_client::retry", %reason, "Retries exhausted; giving up.");
                    return None;
                }

                let mut backoff = self.backoff.clone();
                let base_delay = backoff.next()?;
                let delay = self.apply_jitter(base_delay);
                warn!(
                    target: "longpoll_client::retry",
                    %reason,
                    delay_ms = delay.as_millis() as u64,
                    attempts_remaining = self.attempts_remaining - 1,
                    "Retrying request."
                );

                Some(ExponentialPolicyFuture {
                    delay: Box::pin(sleep(delay)),
                    policy: ExponentialBackoffPolicy {
                        attempts_remaining: self.attempts_remaining - 1,
                        backoff,
                        logic: self.logic.clone(),
                        jitter_mode: self.jitter_mode,
                    },
                })
            }
            RetryAction::DontRetry(reason) => {
                debug!(target: "longpoll_client::retry", %reason, "Not retriable.");
                None
            }
            RetryAction::Successful => None,
        }
    }

    fn clone_request(&self, request: &L::Request) -> Option<L::Request> {
        Some(request.clone())
    }
}

// No field is structurally pinned.
impl<L: RetryLogic> Unpin for ExponentialPolicyFuture<L> {}

impl<L: RetryLogic> Future for ExponentialPolicyFuture<L> {
    type Output = ExponentialBackoffPolicy<L>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        std::task::ready!(self.delay.poll_unpin(cx));
        Poll::Ready(self.policy.clone())
    }
}

/// Retries connection failures, timeouts, `429` and `5xx` answers.
///
/// A message carrying a body is only resent when the connection was never
/// made; any other failure may already have delivered it to the handler.
#[derive(Clone, Copy, Debug, Default)]
pub struct PollRetryLogic;

impl RetryLogic for PollRetryLogic {
    type Error = ClientError;
    type Request = Message;
    type Response = Message;

    fn should_retry_error(&self, request: &Message, error: &ClientError) -> bool {
        if request.has_payload() {
            return matches!(error, ClientError::Transport { source } if source.is_connect());
        }
        self.is_retriable_error(error)
    }

    fn is_retriable_error(&self, error: &Self::Error) -> bool {
        match error {
            ClientError::Transport { source } => source.is_connect() || source.is_timeout(),
            ClientError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}
