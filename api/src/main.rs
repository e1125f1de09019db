use axum::extract::{MatchedPath, Request};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Extension, Router};
use cache::ApiCache;
use config::Config;
use gps::client::CompassClient;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::borrow::Cow;
use std::env;
use std::future::ready;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, prelude::*};
use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_axum::{router::OpenApiRouter, routes};
use utoipa_scalar::{Scalar, Servable as ScalarServable};

mod cache;
mod config;
mod error;
mod gps;
mod handlers;

#[derive(Clone, Debug)]
pub struct State {
    pg_pool: PgPool,
    config: &'static Config,
    compass: Arc<CompassClient>,
    cache: ApiCache,
}

fn main() {
    let config: &'static Config = Box::leak(Box::new(
        Config::new().expect("error: failed to construct config"),
    ));

    if let Some(sentry_url) = &config.sentry_url {
        // Sentry needs to be initialized outside of an async block.
        // See https://docs.sentry.io/platforms/rust.
        let _guard = sentry::init(sentry::ClientOptions {
            dsn: Some(sentry_url.parse().expect("Invalid Sentry DSN")),
            traces_sample_rate: 0.75,
            release: sentry::release_name!(),
            environment: match env::var("ENVIRONMENT") {
                Ok(value) => Some(Cow::Owned(value)),
                Err(_) => Some(Cow::Borrowed("development")),
            },
            ..Default::default()
        });
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Corresponds to `#[tokio::main]`.
    // See https://docs.rs/tokio-macros/latest/src/tokio_macros/lib.rs.html#225.
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("error: failed to initialize tokio runtime")
        .block_on(async {
            _ = tokio::spawn(async move { start_main_server(config).await }).await;
        });
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "cron_secret",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("Authorization"))),
            )
        }
    }
}

#[derive(OpenApi)]
#[openapi(modifiers(&SecurityAddon))]
struct ApiDoc;

async fn start_main_server(config: &'static Config) {
    info!("Starting GPS API v{}", env!("CARGO_PKG_VERSION"));
    // set up connection pool
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .connect(&config.database_url)
        .await
        .expect("can't connect to database.");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("sqlx migration failed");

    let compass =
        CompassClient::from_config(config).expect("error: failed to construct compass client");

    let state = State {
        pg_pool: pool.clone(),
        config,
        compass: Arc::new(compass),
        cache: ApiCache::new(pool, cache::DEFAULT_TTL_SECS),
    };

    let recorder_handle = setup_metrics_recorder();

    // build our application with a route
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .routes(routes!(gps::route::query_gps))
        .routes(routes!(gps::route::run_gps_batch))
        .routes(routes!(gps::route::get_gps))
        .routes(routes!(cache::route::sweep))
        .routes(routes!(handlers::map_key))
        .split_for_parts();

    let json_specification = api.to_pretty_json().expect("API docs generation failed");

    let app: Router = router
        .route("/metrics", get(move || ready(recorder_handle.render())))
        .route("/health", get(handlers::health::check))
        .route_layer(middleware::from_fn(track_metrics))
        .layer(Extension(state))
        .route(
            "/docs/openapi.json",
            get(move || ready(json_specification.clone())),
        )
        .layer(CorsLayer::permissive())
        .merge(Scalar::with_url("/docs", api));

    let listener = TcpListener::bind("0.0.0.0:8080")
        .await
        .expect("error: failed to bind to port");
    info!(
        "GPS API running on http://{} (Press Ctrl+C to quit)",
        listener.local_addr().unwrap().to_string()
    );
    axum::serve(listener, app)
        .await
        .expect("error: failed to initialize axum server");
}

fn setup_metrics_recorder() -> PrometheusHandle {
    // Metrics
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("http_requests_duration_seconds".to_string()),
            EXPONENTIAL_SECONDS,
        )
        .expect("error: failed to build prometheus recorder")
        .install_recorder()
        .expect("error: failed to install prometheus recorder")
}

async fn track_metrics(req: Request, next: Next) -> impl IntoResponse {
    let start = Instant::now();
    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };
    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::increment_counter!("http_requests_total", &labels);
    metrics::histogram!("http_requests_duration_seconds", latency, &labels);

    response
}
