//! Drives a real `Router` over TCP with the client.

use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use bytes::Bytes;
use http::StatusCode;
use longpoll_client::{ClientError, ClientSettings, LongPollClient};
use longpoll_transport::long_poll::{
    Encoding, HandlerError, RouteDefinition, Router, RouterService, Session, TransportSettings,
    serve,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

type TestResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

fn init_tracing() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .init();
    });
}

struct Server {
    router: Arc<Router>,
    endpoint: String,
    shutdown: CancellationToken,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.router.shutdown();
    }
}

async fn start_server() -> Result<Server, Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let router = Router::new(
        TransportSettings::builder()
            .min_client_poll_delay(Duration::from_millis(10))
            .max_client_poll_delay(Duration::from_millis(200))
            .route_resume_timeout(Duration::from_millis(100))
            .garbage_collection_delay(Duration::ZERO)
            .build(),
    );

    router.add_route(RouteDefinition::stream(
        "echo",
        |session: Arc<Session>| async move {
            while let Ok(message) = session.receive().await {
                session.send(message.into_body()).await?;
            }
            Ok::<_, HandlerError>(())
        },
    ))?;
    router.add_route(RouteDefinition::oneshot(
        "delayed-echo",
        |session: Arc<Session>| async move {
            let request = session.receive().await?;
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok::<_, HandlerError>(request.into_body())
        },
    ))?;
    router.add_route(RouteDefinition::oneshot(
        "fail",
        |_session: Arc<Session>| async move { Err::<Bytes, _>(HandlerError::rpc(7, "nope")) },
    ))?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let endpoint = format!("http://{}/", listener.local_addr()?);
    let shutdown = CancellationToken::new();
    tokio::spawn(serve(
        listener,
        RouterService::new(Arc::clone(&router)),
        shutdown.clone(),
    ));

    Ok(Server {
        router,
        endpoint,
        shutdown,
    })
}

#[tokio::test]
async fn oneshot_waits_for_slow_handler() -> TestResult {
    let server = start_server().await?;
    let client = LongPollClient::new(server.endpoint.as_str())?;

    let body = client.oneshot("delayed-echo", "hello").await?;
    assert_eq!(body, "hello");
    Ok(())
}

#[tokio::test]
async fn oneshot_over_json() -> TestResult {
    let server = start_server().await?;
    let client = LongPollClient::with_settings(
        server.endpoint.as_str(),
        ClientSettings::builder().encoding(Encoding::Json).build(),
    )?;

    let body = client.oneshot("delayed-echo", "json").await?;
    assert_eq!(body, "json");
    Ok(())
}

#[tokio::test]
async fn stream_echoes_until_closed() -> TestResult {
    let server = start_server().await?;
    let client = LongPollClient::new(server.endpoint.as_str())?;
    let mut stream = client.open_stream("echo");

    for word in ["alpha", "beta", "gamma"] {
        stream.send(word).await?;
        assert_eq!(stream.recv().await?, Some(Bytes::from(word)));
    }
    assert_eq!(server.router.session_count(), 1);

    stream.close().await?;
    assert!(stream.is_finished());
    assert_eq!(stream.recv().await?, None);
    assert_eq!(server.router.session_count(), 0);
    Ok(())
}

#[tokio::test]
async fn handler_error_reaches_client() -> TestResult {
    let server = start_server().await?;
    let client = LongPollClient::new(server.endpoint.as_str())?;

    match client.oneshot("fail", "").await {
        Err(ClientError::Handler { errors }) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].code, 7);
            assert_eq!(errors[0].message, "nope");
        }
        other => panic!("expected handler error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn unknown_route_is_not_found() -> TestResult {
    let server = start_server().await?;
    let client = LongPollClient::new(server.endpoint.as_str())?;

    let error = client.oneshot("missing", "").await.unwrap_err();
    assert_eq!(error.status(), Some(StatusCode::NOT_FOUND));
    Ok(())
}
