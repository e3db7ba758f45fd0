//! Management API and agent control endpoint for the burrow relay

pub mod control;
pub mod handlers;
pub mod middleware;
pub mod models;

use axum::{
    http::{header, Method},
    middleware as axum_middleware,
    routing::get,
    Router,
};
use burrow_auth::JwtValidator;
use burrow_lib::Broker;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

pub use control::Heartbeat;

/// Application state shared across handlers
pub struct AppState {
    pub broker: Arc<Broker>,
    pub heartbeat: Heartbeat,
}

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// HMAC secret API tokens are signed with
    pub jwt_secret: Vec<u8>,
    /// Required `iss` claim, if any
    pub jwt_issuer: Option<String>,
    /// Required `aud` claim, if any
    pub jwt_audience: Option<String>,
    /// Allow cross-origin requests from anywhere
    pub enable_cors: bool,
    /// Keep-alive for agent control sockets
    pub heartbeat: Heartbeat,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            jwt_secret: Vec::new(),
            jwt_issuer: None,
            jwt_audience: None,
            enable_cors: false,
            heartbeat: Heartbeat::default(),
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, broker: Arc<Broker>) -> Self {
        let state = Arc::new(AppState {
            broker,
            heartbeat: config.heartbeat,
        });
        Self { config, state }
    }

    fn validator(&self) -> JwtValidator {
        let mut validator = JwtValidator::new(&self.config.jwt_secret);
        if let Some(issuer) = &self.config.jwt_issuer {
            validator = validator.with_issuer(issuer.clone());
        }
        if let Some(audience) = &self.config.jwt_audience {
            validator = validator.with_audience(audience.clone());
        }
        validator
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let jwt_state = Arc::new(middleware::JwtState::new(self.validator()));

        // Agents authenticate with their pending token in the handshake
        let public_router = Router::new()
            .route("/health", get(handlers::health_check))
            .route("/ws", get(control::ws_handler))
            .with_state(self.state.clone());

        let protected_router = Router::new()
            .route("/check/auth", get(handlers::check_auth))
            .route(
                "/con",
                get(handlers::list_tunnels)
                    .post(handlers::create_tunnel)
                    .delete(handlers::close_all_tunnels),
            )
            .route(
                "/con/{token}",
                get(handlers::get_tunnel)
                    .patch(handlers::update_tunnel)
                    .delete(handlers::delete_tunnel),
            )
            .route("/con/{token}/port", get(handlers::get_port))
            .route("/con/{token}/protocol", get(handlers::get_protocol))
            .route("/con/{token}/user", get(handlers::get_user))
            .route(
                "/con/{token}/name",
                get(handlers::get_name).patch(handlers::update_name),
            )
            .route(
                "/con/{token}/filter",
                get(handlers::get_filter).patch(handlers::update_filter),
            )
            .route("/usage", get(handlers::usage))
            .with_state(self.state.clone())
            .layer(axum_middleware::from_fn_with_state(
                jwt_state,
                middleware::require_auth,
            ));

        let mut router = public_router
            .merge(protected_router)
            .layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::PATCH])
                    .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
                    .allow_origin(Any),
            );
        }

        router
    }

    /// Serve on an already bound listener until `shutdown` fires
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), anyhow::Error> {
        let router = self.build_router();
        info!("Starting API server on {}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}
