use std::{collections::VecDeque, time::Duration};

use bon::Builder;
use bytes::Bytes;
use longpoll_transport::long_poll::{Encoding, Message, MessageBuilder};
use rand::RngCore;
use reqwest::IntoUrl;
use snafu::{ResultExt, ensure};
use tower::{ServiceExt, retry::Retry};

use crate::{
    retries::{ExponentialBackoff, ExponentialBackoffPolicy, JitterMode, PollRetryLogic},
    transport::{
        BuildClientSnafu, ClientError, ClosedSnafu, HandlerSnafu, HttpTransport, IncompleteSnafu,
        StatusSnafu,
    },
};

const TRACE_ID_BYTES: usize = 8;
const SESSION_ID_BYTES: usize = 16;

/// Client tuning.
///
/// Retries wait `retry_initial_backoff_ms`, then multiply by
/// `retry_exp_base` on each further attempt, never exceeding
/// `retry_max_backoff`.
#[derive(Clone, Copy, Debug, Builder)]
pub struct ClientSettings {
    #[builder(default)]
    encoding: Encoding,
    #[builder(default = 3)]
    retry_max_attempts: usize,
    #[builder(default = 100)]
    retry_initial_backoff_ms: u64,
    #[builder(default = 2)]
    retry_exp_base: u64,
    #[builder(default = Duration::from_secs(5))]
    retry_max_backoff: Duration,
    #[builder(default)]
    retry_jitter: JitterMode,
    /// Used when a response carries no poll delay hint.
    #[builder(default = Duration::from_millis(100))]
    default_poll_delay: Duration,
    #[builder(default = Duration::from_secs(30))]
    request_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClientSettings {
    pub fn get_encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn get_retry_max_attempts(&self) -> usize {
        self.retry_max_attempts
    }

    pub fn get_default_poll_delay(&self) -> Duration {
        self.default_poll_delay
    }

    pub fn get_request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn retry_policy(&self) -> ExponentialBackoffPolicy<PollRetryLogic> {
        let base = self.retry_exp_base.max(1);
        ExponentialBackoffPolicy::new(
            self.retry_max_attempts,
            ExponentialBackoff::from_millis(base)
                .factor((self.retry_initial_backoff_ms / base).max(1))
                .max_delay(self.retry_max_backoff),
            PollRetryLogic,
            self.retry_jitter,
        )
    }
}

pub type PollService = Retry<ExponentialBackoffPolicy<PollRetryLogic>, HttpTransport>;

/// Drives conversations with a long-poll server.
///
/// Cloning is cheap; clones share the underlying connection pool.
#[derive(Clone, Debug)]
pub struct LongPollClient {
    service: PollService,
    settings: ClientSettings,
}

impl LongPollClient {
    pub fn new(endpoint: impl IntoUrl) -> Result<Self, ClientError> {
        Self::with_settings(endpoint, ClientSettings::default())
    }

    pub fn with_settings(
        endpoint: impl IntoUrl,
        settings: ClientSettings,
    ) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .context(BuildClientSnafu)?;
        let transport = HttpTransport::with_client(client, endpoint, settings.encoding)?;
        Ok(Self::from_transport(transport, settings))
    }

    pub fn from_transport(transport: HttpTransport, settings: ClientSettings) -> Self {
        Self {
            service: Retry::new(settings.retry_policy(), transport),
            settings,
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Sends `body` to a Oneshot route and polls until the session ends.
    ///
    /// Returns the last body the handler delivered, or the handler's errors
    /// as [`ClientError::Handler`].
    pub async fn oneshot(&self, route: &str, body: impl Into<Bytes>) -> Result<Bytes, ClientError> {
        let mut conversation = Conversation::new(self.clone(), route);
        let request = conversation.message().body(body);
        let mut response = conversation.exchange(request).await?;

        let mut latest = None;
        loop {
            check_response(&response)?;
            let terminated = response.is_terminated();
            if !response.is_not_ready() {
                latest = Some(response.into_body());
            }
            if terminated {
                return Ok(latest.unwrap_or_default());
            }
            response = conversation.poll().await?;
        }
    }

    /// Starts a conversation with a Stream route. The server side session
    /// is created by the first `send` or `recv`.
    pub fn open_stream(&self, route: &str) -> ClientStream {
        ClientStream {
            conversation: Conversation::new(self.clone(), route),
            received: VecDeque::new(),
            finished: false,
        }
    }
}

/// One side of a Stream route session.
#[derive(Debug)]
pub struct ClientStream {
    conversation: Conversation,
    received: VecDeque<Bytes>,
    finished: bool,
}

impl ClientStream {
    pub fn session_id(&self) -> &str {
        &self.conversation.session_id
    }

    /// True once the server terminated the session or `close` was called.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Delivers `body` to the handler. Anything the server answers with is
    /// buffered for [`recv`](Self::recv).
    pub async fn send(&mut self, body: impl Into<Bytes>) -> Result<(), ClientError> {
        ensure!(!self.finished, ClosedSnafu);
        let request = self.conversation.message().body(body);
        let response = self.conversation.exchange(request).await?;
        self.absorb(response)
    }

    /// Next body from the handler, polling as hinted until one arrives.
    /// `None` once the session has ended and the buffer is drained.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, ClientError> {
        loop {
            if let Some(body) = self.received.pop_front() {
                return Ok(Some(body));
            }
            if self.finished {
                return Ok(None);
            }
            let response = self.conversation.poll().await?;
            self.absorb(response)?;
        }
    }

    /// Ends the session. Buffered bodies stay readable through `recv`.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let request = self.conversation.message().terminated(true);
        self.conversation.exchange(request).await?;
        Ok(())
    }

    fn absorb(&mut self, response: Message) -> Result<(), ClientError> {
        if response.is_terminated() {
            self.finished = true;
        }
        check_response(&response)?;
        let delivered = !response.is_not_ready();
        if delivered && !(response.is_terminated() && response.body().is_empty()) {
            self.received.push_back(response.into_body());
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Conversation {
    client: LongPollClient,
    route: String,
    trace_id: String,
    session_id: String,
    next_delay: Duration,
}

impl Conversation {
    fn new(client: LongPollClient, route: &str) -> Self {
        Self {
            client,
            route: route.to_owned(),
            trace_id: random_hex(TRACE_ID_BYTES),
            session_id: random_hex(SESSION_ID_BYTES),
            next_delay: Duration::ZERO,
        }
    }

    fn message(&self) -> MessageBuilder {
        Message::builder()
            .trace_id(self.trace_id.clone())
            .session_id(self.session_id.clone())
            .route_name(self.route.clone())
    }

    async fn exchange(&mut self, request: MessageBuilder) -> Result<Message, ClientError> {
        let request = request.build().context(IncompleteSnafu)?;
        let response = self.client.service.clone().oneshot(request).await?;

        self.next_delay = response
            .poll_delay_ms()
            .map(|ms| Duration::from_millis(ms.into()))
            .unwrap_or(self.client.settings.default_poll_delay);
        debug!(
            target: "longpoll_client",
            route = %self.route,
            session_id = %self.session_id,
            delay_ms = self.next_delay.as_millis() as u64,
            terminated = response.is_terminated(),
            "Poll answered."
        );
        Ok(response)
    }

    /// Waits out the last hint, then sends a bare poll.
    async fn poll(&mut self) -> Result<Message, ClientError> {
        tokio::time::sleep(self.next_delay).await;
        let request = self.message().not_ready(true);
        self.exchange(request).await
    }
}

fn check_response(response: &Message) -> Result<(), ClientError> {
    ensure!(
        !response.is_error(),
        HandlerSnafu {
            errors: response.errors().to_vec()
        }
    );
    if let Some(status) = response.transport().status.filter(|status| !status.is_success()) {
        return StatusSnafu {
            status,
            body: String::from_utf8_lossy(response.body()).into_owned(),
        }
        .fail();
    }
    Ok(())
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use http::StatusCode;
    use longpoll_transport::long_poll::{ErrorKind, WireError};

    use super::*;

    fn reply() -> MessageBuilder {
        Message::builder().trace_id("t").session_id("s").route_name("r")
    }

    #[test]
    fn retry_policy_starts_at_initial_backoff() {
        let settings = ClientSettings::builder()
            .retry_initial_backoff_ms(200)
            .retry_exp_base(2)
            .build();
        let delays: Vec<_> = ExponentialBackoff::from_millis(settings.retry_exp_base)
            .factor(settings.retry_initial_backoff_ms / settings.retry_exp_base)
            .take(3)
            .collect();
        assert_eq!(delays, [200, 400, 800].map(Duration::from_millis).to_vec());
        assert_eq!(settings.retry_policy().attempts_remaining(), 3);
    }

    #[test]
    fn error_responses_become_errors() {
        let failed = reply()
            .terminated(true)
            .error(WireError::new(ErrorKind::Rpc, 3, "boom"))
            .build()
            .unwrap();
        let error = check_response(&failed).unwrap_err();
        assert!(matches!(error, ClientError::Handler { ref errors } if errors[0].code == 3));

        let forbidden = reply()
            .terminated(true)
            .status(StatusCode::FORBIDDEN)
            .build()
            .unwrap();
        assert_eq!(
            check_response(&forbidden).unwrap_err().status(),
            Some(StatusCode::FORBIDDEN)
        );

        let ok = reply().status(StatusCode::OK).build().unwrap();
        assert!(check_response(&ok).is_ok());
    }

    #[test]
    fn generated_ids_are_hex() {
        let id = random_hex(SESSION_ID_BYTES);
        assert_eq!(id.len(), SESSION_ID_BYTES * 2);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn stream_buffers_delivered_bodies() {
        let client = LongPollClient::new("http://127.0.0.1:1/").unwrap();
        let mut stream = client.open_stream("echo");

        stream
            .absorb(reply().body("a").build().unwrap())
            .unwrap();
        stream
            .absorb(reply().not_ready(true).empty(true).build().unwrap())
            .unwrap();
        stream
            .absorb(reply().terminated(true).not_ready(true).empty(true).build().unwrap())
            .unwrap();

        assert!(stream.is_finished());
        assert_eq!(stream.recv().await.unwrap(), Some(Bytes::from("a")));
        assert_eq!(stream.recv().await.unwrap(), None);
        assert!(matches!(stream.send("late").await, Err(ClientError::Closed)));
    }
}
