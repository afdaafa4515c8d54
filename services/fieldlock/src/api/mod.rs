//! HTTP server assembly: pool, router, gateway layers, background tasks, and
//! graceful shutdown.

pub(crate) mod handlers;
pub(crate) mod middleware;
pub(crate) mod response;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Extension, MatchedPath},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderName, HeaderValue, Method, Request,
    },
    middleware::from_fn,
    routing::{get, post, put},
    Router,
};
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, info_span, warn, Span};
use ulid::Ulid;

use crate::kms::Kms;
use crate::mq::{AuditConsumer, Publisher};
use crate::password::{Hasher, HasherConfig};
use crate::store::fail_count::{DeviceFailStore, PgDeviceFailStore};
use crate::store::rate::{PgRateStore, RateStore};
use crate::store::session::{spawn_expiry_sweeper, PgSessionStore, SessionStore};
use crate::token::TokenCodec;

const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TOKEN_SECRET: &str = "change-me-in-production";

/// Everything the binary needs to bring the server up.
#[derive(Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub dsn: String,
    pub amqp_url: String,
    pub master_key_path: PathBuf,
    pub token_secret: SecretString,
    pub session_ttl_seconds: i64,
    pub hasher: HasherConfig,
    /// Release deployments refuse to start without a master key file.
    pub release_mode: bool,
}

/// Shared per-request state, injected as an `Extension`.
pub struct AppState {
    pub pool: PgPool,
    pub kms: Kms,
    pub tokens: TokenCodec,
    pub hasher: Hasher,
    pub sessions: Arc<dyn SessionStore>,
    pub fail_counts: Arc<dyn DeviceFailStore>,
    pub rates: Arc<dyn RateStore>,
    pub publisher: Option<Publisher>,
    pub session_ttl_seconds: i64,
}

/// Start the server and block until shutdown completes.
///
/// # Errors
/// Returns an error if the database, master key, or listener cannot be set
/// up. A missing broker is not fatal: the server runs without audit
/// publishing and logs a warning.
pub async fn serve(config: ServerConfig) -> Result<()> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(50)
        .max_lifetime(Duration::from_secs(60 * 60))
        .test_before_acquire(true)
        .connect(&config.dsn)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run database migrations")?;

    let kms = Kms::init(&config.master_key_path, config.release_mode)?;
    if config.token_secret.expose_secret() == DEFAULT_TOKEN_SECRET {
        warn!("token secret is the built-in default; set FIELDLOCK_TOKEN_SECRET in production");
    }
    let tokens = TokenCodec::new(&config.token_secret)?;
    let hasher = Hasher::new(&config.hasher)?;

    let publisher = match Publisher::connect(&config.amqp_url).await {
        Ok(publisher) => Some(publisher),
        Err(err) => {
            warn!("message broker unavailable, running without audit publishing: {err:#}");
            None
        }
    };
    let consumer = if publisher.is_some() {
        match AuditConsumer::start(&config.amqp_url, pool.clone()).await {
            Ok(consumer) => Some(consumer),
            Err(err) => {
                warn!("failed to start audit consumer: {err:#}");
                None
            }
        }
    } else {
        None
    };

    let sessions: Arc<dyn SessionStore> = Arc::new(PgSessionStore::new(pool.clone()));
    let sweeper = spawn_expiry_sweeper(sessions.clone());

    let state = Arc::new(AppState {
        pool: pool.clone(),
        kms,
        tokens,
        hasher,
        sessions,
        fail_counts: Arc::new(PgDeviceFailStore::new(pool.clone())),
        rates: Arc::new(PgRateStore::new(pool.clone())),
        publisher: publisher.clone(),
        session_ttl_seconds: config.session_ttl_seconds,
    });

    let app = router(state);

    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.port)))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    info!("listening on 0.0.0.0:{}", config.port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    info!("shutting down");
    sweeper.abort();
    if let Some(consumer) = consumer {
        consumer.shutdown().await;
    }
    if let Some(publisher) = publisher {
        publisher.close().await;
    }
    pool.close().await;
    info!("server exited");
    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/api/health", get(handlers::health::health))
        .merge(
            Router::new()
                .route("/api/auth/login", post(handlers::auth::login))
                .route_layer(from_fn(middleware::login_rate_gate)),
        );

    let protected = Router::new()
        .route("/api/auth/logout", post(handlers::auth::logout))
        .route("/api/lock/devices", get(handlers::lock::devices))
        .route("/api/lock/challenge", post(handlers::lock::challenge))
        .route("/api/lock/report", post(handlers::lock::report))
        .route_layer(from_fn(middleware::require_session));

    let admin = Router::new()
        .route(
            "/api/admin/users",
            get(handlers::admin::list_users).post(handlers::admin::create_user),
        )
        .route("/api/admin/users/{user_uuid}", put(handlers::admin::update_user))
        .route(
            "/api/admin/users/{user_uuid}/reset-password",
            post(handlers::admin::reset_password),
        )
        .route(
            "/api/admin/devices",
            get(handlers::admin::list_devices).post(handlers::admin::create_device),
        )
        .route(
            "/api/admin/permissions",
            get(handlers::admin::list_permissions).post(handlers::admin::grant_permission),
        )
        .route(
            "/api/admin/permissions/{permission_id}/revoke",
            post(handlers::admin::revoke_permission),
        )
        .route("/api/admin/alerts", get(handlers::admin::list_alerts))
        .route(
            "/api/admin/alerts/{alert_id}/handle",
            post(handlers::admin::handle_alert),
        )
        .route("/api/admin/audit-logs", get(handlers::admin::list_audit_logs))
        // Session first, then role: route layers run outermost-last.
        .route_layer(from_fn(middleware::require_admin))
        .route_layer(from_fn(middleware::require_session));

    let cors = CorsLayer::new()
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_origin(Any);

    public.merge(protected).merge(admin).layer(
        ServiceBuilder::new()
            .layer(CatchPanicLayer::custom(middleware::handle_panic))
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &Request<Body>| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(from_fn(middleware::security_headers))
            .layer(cors)
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(TimeoutLayer::new(WRITE_TIMEOUT))
            .layer(Extension(state))
            .layer(from_fn(middleware::global_rate_gate)),
    )
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to install ctrl-c handler: {err}");
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
                warn!("failed to install sigterm handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received, draining active handlers");
}
