use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::{
    HeaderValue, StatusCode,
    header::{CONTENT_TYPE, SET_COOKIE},
};
use longpoll_transport::long_poll::{
    Encoding, Message, WireError,
    message::{BuildError, DecodeError, EncodeError},
};
use reqwest::IntoUrl;
use snafu::{ResultExt, Snafu};
use tower::Service;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    #[snafu(display("failed to build HTTP client: {source}"))]
    BuildClient { source: reqwest::Error },

    #[snafu(display("invalid endpoint: {source}"))]
    Endpoint { source: reqwest::Error },

    #[snafu(display("incomplete message: {source}"))]
    Incomplete { source: BuildError },

    #[snafu(display("failed to encode request: {source}"))]
    Encode { source: EncodeError },

    #[snafu(display("request failed: {source}"))]
    Transport { source: reqwest::Error },

    #[snafu(display("server answered {status}: {body}"))]
    Status { status: StatusCode, body: String },

    #[snafu(display("malformed response: {source}"))]
    Decode { source: DecodeError },

    #[snafu(display("session failed: {}", describe(errors)))]
    Handler { errors: Vec<WireError> },

    #[snafu(display("session is closed"))]
    Closed,
}

impl ClientError {
    /// HTTP status behind this error, if the server answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            ClientError::Transport { source } => source.status(),
            _ => None,
        }
    }
}

fn describe(errors: &[WireError]) -> String {
    errors
        .iter()
        .map(|error| format!("{:?} {}: {}", error.kind, error.code, error.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A `tower::Service` posting one encoded [`Message`] per request.
///
/// Responses whose content type is a message encoding are decoded whatever
/// their status, with the status and any `Set-Cookie` headers kept on the
/// message. Anything else that is not a success becomes
/// [`ClientError::Status`].
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    encoding: Encoding,
}

impl HttpTransport {
    pub fn new(endpoint: impl IntoUrl, encoding: Encoding) -> Result<Self, ClientError> {
        Self::with_client(reqwest::Client::new(), endpoint, encoding)
    }

    pub fn with_client(
        client: reqwest::Client,
        endpoint: impl IntoUrl,
        encoding: Encoding,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            client,
            endpoint: endpoint.into_url().context(EndpointSnafu)?,
            encoding,
        })
    }

    pub fn endpoint(&self) -> &reqwest::Url {
        &self.endpoint
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }
}

impl Service<Message> for HttpTransport {
    type Response = Message;
    type Error = ClientError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, message: Message) -> Self::Future {
        let encoding = self.encoding;
        let body = match encoding.encode(&message).context(EncodeSnafu) {
            Ok(body) => body,
            Err(error) => return Box::pin(async move { Err(error) }),
        };
        let request = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, encoding.content_type())
            .body(body);

        Box::pin(async move {
            let response = request.send().await.context(TransportSnafu)?;
            let status = response.status();
            let response_encoding = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .and_then(Encoding::from_content_type);
            let cookies: Vec<HeaderValue> =
                response.headers().get_all(SET_COOKIE).iter().cloned().collect();
            let bytes = response.bytes().await.context(TransportSnafu)?;

            let Some(response_encoding) = response_encoding else {
                return StatusSnafu {
                    status,
                    body: String::from_utf8_lossy(&bytes).into_owned(),
                }
                .fail();
            };

            let reply = response_encoding
                .decode(&bytes)
                .context(DecodeSnafu)?
                .status(status)
                .cookies(cookies)
                .build()
                .context(IncompleteSnafu)?;
            trace!(
                target: "longpoll_client::transport",
                session_id = %reply.session_id(),
                %status,
                terminated = reply.is_terminated(),
                not_ready = reply.is_not_ready(),
                "Received poll response."
            );
            Ok(reply)
        })
    }
}

#[cfg(test)]
mod tests {
    use longpoll_transport::long_poll::ErrorKind;

    use super::*;

    #[test]
    fn handler_errors_are_listed() {
        let error = ClientError::Handler {
            errors: vec![
                WireError::new(ErrorKind::Rpc, 7, "nope"),
                WireError::new(ErrorKind::Protocol, 0, "closed"),
            ],
        };
        assert_eq!(
            error.to_string(),
            "session failed: Rpc 7: nope; Protocol 0: closed"
        );
    }

    #[test]
    fn status_is_exposed() {
        let error = ClientError::Status {
            status: StatusCode::NOT_FOUND,
            body: "no route".into(),
        };
        assert_eq!(error.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(ClientError::Closed.status(), None);
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        let error = HttpTransport::new("not a url", Encoding::Binary).unwrap_err();
        assert!(matches!(error, ClientError::Endpoint { .. }));
    }
}
