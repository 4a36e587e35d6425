//! Demo long-poll server.
//!
//! Routes:
//! - `echo` (Stream): answers every request body with itself.
//! - `delayed-echo` (Oneshot): waits `ECHO_DELAY_MS`, then returns the body.
//! - `ticker` (Stream): sends an increasing counter every `TICK_MS`.

use std::{env, net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use longpoll_transport::long_poll::{
    HandlerError, RouteDefinition, Router, RouterService, Session, TracingMiddleware,
    TransportSettings, serve,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const ENV_LISTEN_ADDR: &str = "LONGPOLL_LISTEN_ADDR";
const ENV_ECHO_DELAY_MS: &str = "ECHO_DELAY_MS";
const ENV_TICK_MS: &str = "TICK_MS";
const ENV_MIN_POLL_DELAY_MS: &str = "LONGPOLL_MIN_POLL_DELAY_MS";
const ENV_MAX_POLL_DELAY_MS: &str = "LONGPOLL_MAX_POLL_DELAY_MS";
const ENV_RESUME_TIMEOUT_MS: &str = "LONGPOLL_RESUME_TIMEOUT_MS";
const ENV_GC_DELAY_SECS: &str = "LONGPOLL_GC_DELAY_SECS";
const ENV_SESSION_STALE_SECS: &str = "LONGPOLL_SESSION_STALE_SECS";

fn get_env_var<T: FromStr + std::fmt::Debug>(var_name: &str, default_value: T) -> T
where
    <T as FromStr>::Err: std::fmt::Debug,
{
    env::var(var_name)
        .ok()
        .and_then(|val_str| match val_str.parse::<T>() {
            Ok(val) => Some(val),
            Err(e) => {
                warn!(
                    "Failed to parse env var '{}' (value: '{}'). Error: {:?}. Using default: {:?}",
                    var_name, val_str, e, default_value
                );
                None
            }
        })
        .unwrap_or(default_value)
}

fn millis(var_name: &str, default_value: Duration) -> Duration {
    Duration::from_millis(get_env_var(var_name, default_value.as_millis() as u64))
}

fn settings_from_env() -> TransportSettings {
    let defaults = TransportSettings::default();
    TransportSettings::builder()
        .min_client_poll_delay(millis(
            ENV_MIN_POLL_DELAY_MS,
            defaults.get_min_client_poll_delay(),
        ))
        .max_client_poll_delay(millis(
            ENV_MAX_POLL_DELAY_MS,
            defaults.get_max_client_poll_delay(),
        ))
        .route_resume_timeout(millis(
            ENV_RESUME_TIMEOUT_MS,
            defaults.get_route_resume_timeout(),
        ))
        .garbage_collection_delay(Duration::from_secs(get_env_var(
            ENV_GC_DELAY_SECS,
            defaults.get_garbage_collection_delay().as_secs(),
        )))
        .session_stale_after(Duration::from_secs(get_env_var(
            ENV_SESSION_STALE_SECS,
            defaults.get_session_stale_after().as_secs(),
        )))
        .build()
}

fn demo_routes(echo_delay: Duration, tick: Duration) -> [RouteDefinition; 3] {
    let echo = RouteDefinition::stream("echo", |session: Arc<Session>| async move {
        while let Ok(message) = session.receive().await {
            session.send(message.into_body()).await?;
        }
        Ok::<_, HandlerError>(())
    });

    let delayed_echo = RouteDefinition::oneshot("delayed-echo", move |session: Arc<Session>| async move {
        let request = session.receive().await?;
        tokio::time::sleep(echo_delay).await;
        Ok::<_, HandlerError>(request.into_body())
    });

    let ticker = RouteDefinition::stream("ticker", move |session: Arc<Session>| async move {
        let mut interval = tokio::time::interval(tick);
        let mut count = 0u64;
        loop {
            interval.tick().await;
            count += 1;
            if session.send(count.to_string()).await.is_err() {
                break;
            }
        }
        Ok::<_, HandlerError>(())
    });

    [echo, delayed_echo, ticker].map(|route| route.middleware(TracingMiddleware))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let default_log_filter = "info,longpoll_echo=info,long_poll=info";
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| default_log_filter.to_string()))
        .init();

    if dotenvy::dotenv().is_ok() {
        info!(".env file loaded.");
    }

    let settings = settings_from_env();
    let router = Router::new(settings);
    let routes = demo_routes(
        millis(ENV_ECHO_DELAY_MS, Duration::from_millis(1000)),
        millis(ENV_TICK_MS, Duration::from_millis(500)),
    );
    for route in routes {
        router.add_route(route)?;
    }

    let address: SocketAddr = get_env_var(ENV_LISTEN_ADDR, SocketAddr::from(([127, 0, 0, 1], 8080)));
    let listener = TcpListener::bind(address).await?;
    info!(?settings, %address, "Serving long-poll routes: echo, delayed-echo, ticker");

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down.");
                on_signal.cancel();
            }
            Err(error) => warn!(%error, "Failed to listen for Ctrl-C."),
        }
    });

    let service = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .service(RouterService::new(Arc::clone(&router)));
    serve(listener, service, shutdown).await;

    let closed = router.shutdown();
    info!(closed, "Router shut down.");
    Ok(())
}
