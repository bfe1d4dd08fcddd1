use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use domain::services::{
    AccessControl, AccessControlSettings, Collaborators, IntegrityAnchor, IntegrityPolicy,
    IssuerPolicy, MockIntegrityAnchor, SystemClock,
};
use persistence::repositories::{
    AccessCodeRepository, AttendanceRepository, RegistrationRepository, ScanAttemptRepository,
};

use crate::config::Config;
use crate::middleware::{metrics_handler, metrics_middleware, require_auth, trace_id, RateLimiterState};
use crate::routes::{access_codes, health, scans};
use crate::services::HttpAnchorClient;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub access: Arc<AccessControl>,
    pub rate_limiter: Arc<RateLimiterState>,
    /// Present when anchoring talks to a real service rather than the mock.
    pub anchor_client: Option<Arc<HttpAnchorClient>>,
}

impl AppState {
    /// Wire the PostgreSQL adapters and the configured anchor.
    pub fn new(config: Config, pool: PgPool) -> Result<Self, reqwest::Error> {
        let anchor_client = if config.anchor.enabled && !config.anchor.url.is_empty() {
            Some(Arc::new(HttpAnchorClient::new(&config.anchor)?))
        } else {
            None
        };
        let anchor: Option<Arc<dyn IntegrityAnchor>> = match (&anchor_client, config.anchor.enabled) {
            (Some(client), _) => Some(client.clone() as Arc<dyn IntegrityAnchor>),
            (None, true) => {
                tracing::warn!("Anchoring enabled without a URL; using the in-process mock anchor");
                Some(Arc::new(MockIntegrityAnchor::new()) as Arc<dyn IntegrityAnchor>)
            }
            (None, false) => None,
        };

        let collaborators = Collaborators {
            store: Arc::new(AccessCodeRepository::new(pool.clone())),
            attempts: Arc::new(ScanAttemptRepository::new(pool.clone())),
            registrations: Arc::new(RegistrationRepository::new(pool.clone())),
            attendance: Arc::new(AttendanceRepository::new(pool.clone())),
            anchor,
            clock: Arc::new(SystemClock),
        };

        let mut state = Self::with_collaborators(config, pool, collaborators);
        state.anchor_client = anchor_client;
        Ok(state)
    }

    /// Build state over arbitrary adapters. Tests pass in-memory ones.
    pub fn with_collaborators(config: Config, pool: PgPool, collaborators: Collaborators) -> Self {
        let settings = access_control_settings(&config);
        let rate_limiter = Arc::new(RateLimiterState::new(
            config.security.scan_rate_limit_per_minute,
        ));

        Self {
            pool,
            config: Arc::new(config),
            access: Arc::new(AccessControl::new(collaborators, settings)),
            rate_limiter,
            anchor_client: None,
        }
    }
}

pub fn access_control_settings(config: &Config) -> AccessControlSettings {
    AccessControlSettings {
        issuer: IssuerPolicy {
            default_validity: chrono::Duration::hours(config.access_codes.default_validity_hours),
            default_scan_policy: config.access_codes.scan_policy,
        },
        integrity: IntegrityPolicy {
            timeout: Duration::from_millis(config.anchor.timeout_ms),
            scan_budget: Duration::from_millis(config.anchor.scan_verify_timeout_ms),
            max_attempts: config.anchor.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.anchor.initial_backoff_ms),
        },
    }
}

pub fn create_app(state: AppState) -> Router {
    let config = state.config.clone();

    let cors = if config.security.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        use tower_http::cors::AllowOrigin;
        let origins: Vec<_> = config
            .security
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let protected_routes = Router::new()
        .route("/api/v1/codes", post(access_codes::issue_code))
        .route("/api/v1/codes/:code_id", get(access_codes::get_code))
        .route(
            "/api/v1/codes/:code_id/invalidate",
            post(access_codes::invalidate_code),
        )
        .route(
            "/api/v1/codes/:code_id/scans",
            get(access_codes::list_scan_attempts),
        )
        .route(
            "/api/v1/codes/:code_id/integrity",
            get(access_codes::get_integrity),
        )
        .route(
            "/api/v1/registrations/:registration_id/codes",
            get(access_codes::list_registration_codes),
        )
        .route(
            "/api/v1/registrations/:registration_id/codes/regenerate",
            post(access_codes::regenerate_code),
        )
        .route("/api/v1/events/:event_id/stats", get(access_codes::event_stats))
        .route("/api/v1/scans/validate", post(scans::validate_scan))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public_routes = Router::new()
        .route("/api/health", get(health::health_check))
        .route("/api/health/live", get(health::live))
        .route("/api/health/ready", get(health::ready))
        .route("/metrics", get(metrics_handler));

    Router::new()
        .merge(protected_routes)
        .merge(public_routes)
        // Bottom layers run first
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.server.request_timeout_secs,
        )))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(trace_id))
        .layer(cors)
        .with_state(state)
}
