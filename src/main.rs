use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use roomcast::chat;
use roomcast::config::Config;
use roomcast::registry::Registry;
use roomcast::signaling;
use roomcast::viewer;
use roomcast::ws;

/// How long in-flight connections get to drain after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct AppState {
    registry: Registry,
    config: Arc<Config>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(err) = run().await {
        tracing::error!("server error: {}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), std::io::Error> {
    let config = Arc::new(Config::from_env());
    let shutdown = CancellationToken::new();
    let registry = Registry::new(shutdown.clone());
    let state = AppState { registry, config: Arc::clone(&config) };

    let app = Router::new()
        .route("/room/create", get(room_create))
        .route("/room/:uuid/websocket", get(room_websocket))
        .route("/room/:uuid/chat/websocket", get(room_chat_websocket))
        .route("/room/:uuid/viewer/websocket", get(room_viewer_websocket))
        .route("/stream/:suuid/websocket", get(stream_websocket))
        .route("/stream/:suuid/chat/websocket", get(stream_chat_websocket))
        .route("/stream/:suuid/viewer/websocket", get(stream_viewer_websocket))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            shutdown.cancel();
        });
    }

    let mut server = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        })
    };

    tokio::select! {
        _ = shutdown.cancelled() => {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
                Ok(_) => tracing::info!("server stopped gracefully"),
                Err(_) => tracing::warn!("shutdown grace period elapsed, forcing exit"),
            }
        }
        result = &mut server => match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(err) => tracing::error!("server task failed: {}", err),
        },
    }
    Ok(())
}

async fn wait_for_signal() {
    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}

/// Spawns the session once hyper hands over the hijacked stream.
fn spawn_session<F, Fut>(pending: ws::upgrade::PendingWebSocket, session: F)
where
    F: FnOnce(Arc<ws::WebSocket>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        match pending.into_socket().await {
            Ok(socket) => session(Arc::new(socket)).await,
            Err(err) => tracing::error!("websocket upgrade failed: {}", err),
        }
    });
}

fn switching_protocols(response: http::Response<()>) -> Response {
    response.map(|_| Body::empty())
}

async fn room_create() -> Redirect {
    Redirect::to(&format!("/room/{}", Uuid::new_v4()))
}

async fn room_websocket(
    Path(uuid): Path<String>,
    State(state): State<AppState>,
    mut req: Request,
) -> Response {
    let (response, pending) = match ws::upgrade::upgrade(&mut req) {
        Ok(pair) => pair,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    let (_stream_id, room) = state.registry.get_or_create(&uuid);
    let config = Arc::clone(&state.config);
    spawn_session(pending, move |socket| async move {
        if let Err(err) = signaling::room_conn(socket, room.peers, &config).await {
            tracing::debug!("room session {} ended: {}", uuid, err);
        }
    });
    switching_protocols(response)
}

async fn room_chat_websocket(
    Path(uuid): Path<String>,
    State(state): State<AppState>,
    mut req: Request,
) -> Response {
    let Some(room) = state.registry.room(&uuid) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let (response, pending) = match ws::upgrade::upgrade(&mut req) {
        Ok(pair) => pair,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    spawn_session(pending, move |socket| chat::peer_chat_conn(socket, room.hub));
    switching_protocols(response)
}

async fn room_viewer_websocket(
    Path(uuid): Path<String>,
    State(state): State<AppState>,
    mut req: Request,
) -> Response {
    let Some(room) = state.registry.room(&uuid) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let (response, pending) = match ws::upgrade::upgrade(&mut req) {
        Ok(pair) => pair,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    spawn_session(pending, move |socket| viewer::viewer_conn(socket, room.peers));
    switching_protocols(response)
}

async fn stream_websocket(
    Path(suuid): Path<String>,
    State(state): State<AppState>,
    mut req: Request,
) -> Response {
    let Some(room) = state.registry.stream(&suuid) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let (response, pending) = match ws::upgrade::upgrade(&mut req) {
        Ok(pair) => pair,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    let config = Arc::clone(&state.config);
    spawn_session(pending, move |socket| async move {
        if let Err(err) = signaling::stream_conn(socket, room.peers, &config).await {
            tracing::debug!("stream session {} ended: {}", suuid, err);
        }
    });
    switching_protocols(response)
}

async fn stream_chat_websocket(
    Path(suuid): Path<String>,
    State(state): State<AppState>,
    mut req: Request,
) -> Response {
    let Some(room) = state.registry.stream(&suuid) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let (response, pending) = match ws::upgrade::upgrade(&mut req) {
        Ok(pair) => pair,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    spawn_session(pending, move |socket| chat::peer_chat_conn(socket, room.hub));
    switching_protocols(response)
}

async fn stream_viewer_websocket(
    Path(suuid): Path<String>,
    State(state): State<AppState>,
    mut req: Request,
) -> Response {
    let Some(room) = state.registry.stream(&suuid) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let (response, pending) = match ws::upgrade::upgrade(&mut req) {
        Ok(pair) => pair,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    spawn_session(pending, move |socket| viewer::viewer_conn(socket, room.peers));
    switching_protocols(response)
}
