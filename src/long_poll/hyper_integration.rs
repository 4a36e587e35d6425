//! Serving a [`Router`] with hyper.
//!
//! [`RouterService`] is a plain `tower::Service` over `http` types, so it can
//! be wrapped in layers before [`serve`] hands it to hyper.

use std::{
    future::pending,
    net::SocketAddr,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{Request, Response};
use http_body::Body;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::{body::Incoming, server::conn::http1};
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tower::Service;

use super::{http::RouterError, router::Router};

/// Adapts a [`Router`] to `tower::Service<http::Request<B>>`.
///
/// Error responses are rendered as plain text. A cancelled poll resolves to
/// `Err(RouterError::Cancelled)` so the server drops the connection instead
/// of answering.
#[derive(Clone, Debug)]
pub struct RouterService {
    router: Arc<Router>,
}

impl RouterService {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }
}

impl<B> Service<Request<B>> for RouterService
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<crate::Error>,
{
    type Response = Response<Full<Bytes>>;
    type Error = RouterError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let router = Arc::clone(&self.router);
        Box::pin(async move {
            let limit = router.settings().get_max_body_bytes();
            let (parts, body) = request.into_parts();

            let result = match read_body(body, limit).await {
                Ok(body) => {
                    // Dropping this future is how a vanished client cancels.
                    router
                        .dispatch(Request::from_parts(parts, body), pending())
                        .await
                }
                Err(error) => Err(error),
            };

            match result {
                Ok(response) => Ok(response),
                Err(error) => match error.to_response() {
                    Some(response) => {
                        debug!(target: "long_poll::http", %error, status = %response.status(), "Request rejected");
                        Ok(response)
                    }
                    None => Err(error),
                },
            }
        })
    }
}

async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, RouterError>
where
    B: Body,
    B::Error: Into<crate::Error>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(source) if source.is::<LengthLimitError>() => Err(RouterError::BodyTooLarge { limit }),
        Err(source) => Err(RouterError::ReadBody { source }),
    }
}

/// Accepts connections on `listener` until `shutdown` is cancelled, serving
/// each with HTTP/1.1 on its own task. In-flight connections are shut down
/// gracefully before this returns.
pub async fn serve<S, B>(listener: TcpListener, service: S, shutdown: CancellationToken)
where
    S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<crate::Error>,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<crate::Error>,
{
    if let Ok(address) = listener.local_addr() {
        info!(target: "long_poll::http", %address, "Listening");
    }

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_connection(stream, peer, service.clone(), shutdown.clone()));
                }
                Err(error) => {
                    warn!(target: "long_poll::http", %error, "Accept failed");
                }
            },
            // reap finished connections so the set does not grow unbounded
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    while connections.join_next().await.is_some() {}
    info!(target: "long_poll::http", "Server stopped");
}

async fn serve_connection<S, B>(
    stream: TcpStream,
    peer: SocketAddr,
    service: S,
    shutdown: CancellationToken,
) where
    S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<crate::Error>,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<crate::Error>,
{
    let connection = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(service));
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };
    if let Err(error) = result {
        debug!(target: "long_poll::http", %peer, %error, "Connection ended");
    }
}
