use bytes::Bytes;
use http::{HeaderValue, Response, StatusCode, header::CONTENT_TYPE};
use http_body_util::Full;
use snafu::Snafu;

use super::{
    message::{BuildError, DecodeError, EncodeError},
    session::SessionError,
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RouterError {
    #[snafu(display("no route named {route:?}"))]
    UnknownRoute { route: String },

    #[snafu(display("route {route:?} is already registered"))]
    RouteExists { route: String },

    #[snafu(display("method {method} is not allowed, use POST"))]
    MethodNotAllowed { method: http::Method },

    #[snafu(display("unsupported content type {content_type:?}"))]
    UnsupportedContentType { content_type: String },

    #[snafu(display("request body exceeds {limit} bytes"))]
    BodyTooLarge { limit: usize },

    #[snafu(display("failed to read request body: {source}"))]
    ReadBody { source: crate::Error },

    #[snafu(display("malformed message: {source}"))]
    MalformedBody { source: DecodeError },

    #[snafu(display("incomplete message: {source}"))]
    IncompleteMessage { source: BuildError },

    #[snafu(display("failed to build poll response: {source}"))]
    Response { source: BuildError },

    #[snafu(display("failed to encode poll response: {source}"))]
    Encode { source: EncodeError },

    #[snafu(display("{source}"))]
    Session { source: SessionError },

    #[snafu(display("poll cancelled"))]
    Cancelled,
}

impl RouterError {
    /// HTTP status reported to the client. Cancelled polls have none: the
    /// caller is gone and nothing should be written.
    pub fn status_code(&self) -> Option<StatusCode> {
        let status = match self {
            RouterError::UnknownRoute { .. } => StatusCode::NOT_FOUND,
            RouterError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            RouterError::UnsupportedContentType { .. }
            | RouterError::ReadBody { .. }
            | RouterError::MalformedBody { .. }
            | RouterError::IncompleteMessage { .. } => StatusCode::BAD_REQUEST,
            RouterError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            RouterError::RouteExists { .. }
            | RouterError::Response { .. }
            | RouterError::Encode { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            RouterError::Session { .. } => StatusCode::GONE,
            RouterError::Cancelled => return None,
        };
        Some(status)
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, RouterError::Cancelled)
    }

    /// Plain-text response describing the error, if one should be sent.
    pub fn to_response(&self) -> Option<Response<Full<Bytes>>> {
        let status = self.status_code()?;
        let mut response = Response::new(Full::new(Bytes::from(self.to_string())));
        *response.status_mut() = status;
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Some(response)
    }
}
