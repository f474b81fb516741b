use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use parlor_api::{messages, middleware::require_auth, rooms, AppState, AppStateInner};
use parlor_gateway::{connection, Dispatcher, SentimentClient};

/// Expired rooms are swept once an hour; resolution also hides them in the
/// meantime, so the sweep is pure cleanup.
const ROOM_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
struct ServerState {
    dispatcher: Dispatcher,
    jwt_secret: String,
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("PARLOR_LOG")
                .unwrap_or_else(|_| "parlor=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("PARLOR_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("PARLOR_DB_PATH").unwrap_or_else(|_| "parlor.db".into());
    let host = std::env::var("PARLOR_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PARLOR_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let sentiment_url = std::env::var("PARLOR_SENTIMENT_URL").ok();

    // Init database and seed the prebuilt rooms
    let db = Arc::new(parlor_db::Database::open(&PathBuf::from(&db_path))?);
    let seeded = db.ensure_prebuilt_rooms()?;
    info!("{} prebuilt rooms available", seeded.len());

    // Shared state
    let sentiment = SentimentClient::new(sentiment_url);
    let dispatcher = Dispatcher::new(db.clone(), sentiment);
    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        jwt_secret: jwt_secret.clone(),
    });

    spawn_room_sweeper(db);

    // Routes
    let query_routes = Router::new()
        .route("/rooms/ensure-prebuilt", get(rooms::ensure_prebuilt))
        .route("/rooms/direct/{other_user_id}", post(rooms::resolve_direct))
        .route("/rooms/{room_id}", get(rooms::get_room))
        .route("/rooms/{room_id}/messages", get(messages::get_history))
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            require_auth,
        ))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(ServerState {
            dispatcher,
            jwt_secret,
        });

    let app = Router::new()
        .merge(query_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("parlor server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        connection::handle_connection(socket, state.dispatcher, query.token, &state.jwt_secret)
            .await;
    })
}

/// Passive expiry cleanup: temporary rooms past their deadline disappear
/// from resolution immediately; this removes the rows.
fn spawn_room_sweeper(db: Arc<parlor_db::Database>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ROOM_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let db = db.clone();
            let swept =
                tokio::task::spawn_blocking(move || db.purge_expired_rooms(chrono::Utc::now()))
                    .await;
            match swept {
                Ok(Ok(0)) => {}
                Ok(Ok(n)) => info!("swept {n} expired rooms"),
                Ok(Err(err)) => error!("room sweep failed: {err}"),
                Err(err) => error!("room sweep task failed: {err}"),
            }
        }
    });
}
