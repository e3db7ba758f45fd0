//! HTTP handlers for the management API
//!
//! Every tunnel route is scoped to the authenticated caller: the JWT `name`
//! claim is the owner under which tunnels are provisioned and looked up.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use burrow_auth::{permissions, JwtClaims};
use burrow_lib::{BrokerError, Protocol, ProvisionRequest, TunnelInfo, UsageResponse};
use std::sync::Arc;
use tracing::{debug, info};

use crate::models::{
    CloseAllResponse, ErrorResponse, FilterBody, HealthResponse, MessageResponse, NameBody,
    PortBody, ProtocolBody, UserBody,
};
use crate::AppState;

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (status, Json(ErrorResponse::new(error, code)))
}

fn broker_error(e: BrokerError) -> ApiError {
    let (status, code) = match &e {
        BrokerError::ExhaustedRange { .. } => (StatusCode::SERVICE_UNAVAILABLE, "PORT_EXHAUSTED"),
        BrokerError::PortConflict(_) => (StatusCode::CONFLICT, "PORT_CONFLICT"),
        BrokerError::InvalidPort(_) => (StatusCode::BAD_REQUEST, "INVALID_PORT"),
        BrokerError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        BrokerError::NoSuchPendingRequest => (StatusCode::NOT_FOUND, "NO_PENDING_REQUEST"),
        BrokerError::MissingProtocol => (StatusCode::BAD_REQUEST, "MISSING_PROTOCOL"),
        BrokerError::UnsupportedProtocol(_) => {
            (StatusCode::UNPROCESSABLE_ENTITY, "UNSUPPORTED_PROTOCOL")
        }
        BrokerError::InvalidFilter(_) => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_FILTER"),
        BrokerError::Listener(_) => (StatusCode::INTERNAL_SERVER_ERROR, "TUNNEL_ERROR"),
    };
    api_error(status, e.to_string(), code)
}

/// Health check
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_tunnels: state.broker.tunnel_count().await,
        pending_tunnels: state.broker.pending_count(),
    })
}

/// Echo the caller's validated claims
pub async fn check_auth(Extension(claims): Extension<JwtClaims>) -> Json<JwtClaims> {
    Json(claims)
}

/// Provision a tunnel; the agent activates it later over `/ws`
pub async fn create_tunnel(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Json(request): Json<ProvisionRequest>,
) -> ApiResult<TunnelInfo> {
    let required = match request.protocol {
        Some(Protocol::Tcp) => permissions::NEW_TCP,
        Some(Protocol::Udp) => permissions::NEW_UDP,
        None => return Err(broker_error(BrokerError::MissingProtocol)),
    };
    if !claims.has_perm(required) {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            format!("Missing permission '{}'", required),
            "FORBIDDEN",
        ));
    }

    info!(
        "Provisioning tunnel for {} (permissions: {:?}, token expires {})",
        claims.name,
        claims.perm,
        claims.exp_formatted()
    );

    let may_select_port = claims.has_perm(permissions::PORT_SELECT);
    state
        .broker
        .provision(&claims.name, request, may_select_port)
        .map(Json)
        .map_err(broker_error)
}

pub async fn list_tunnels(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
) -> Json<Vec<TunnelInfo>> {
    Json(state.broker.list(&claims.name).await)
}

pub async fn close_all_tunnels(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
) -> Json<CloseAllResponse> {
    let closed = state.broker.close_all(&claims.name).await;
    Json(CloseAllResponse {
        message: "All tunnels closed".to_string(),
        closed,
    })
}

pub async fn get_tunnel(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(token): Path<String>,
) -> ApiResult<TunnelInfo> {
    let tunnel = state
        .broker
        .get(&claims.name, &token)
        .await
        .map_err(broker_error)?;
    Ok(Json(tunnel.info()))
}

pub async fn delete_tunnel(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(token): Path<String>,
) -> ApiResult<MessageResponse> {
    state
        .broker
        .close(&claims.name, &token)
        .await
        .map_err(broker_error)?;
    Ok(Json(MessageResponse {
        message: "Tunnel closed".to_string(),
    }))
}

/// Partial update. The protocol cannot change; port, filter and name are
/// applied in that order, and a filter is validated before anything moves.
pub async fn update_tunnel(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(token): Path<String>,
    Json(update): Json<ProvisionRequest>,
) -> ApiResult<TunnelInfo> {
    let tunnel = state
        .broker
        .get(&claims.name, &token)
        .await
        .map_err(broker_error)?;

    if update.protocol.is_some_and(|p| p != tunnel.protocol()) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "The protocol of a tunnel cannot be changed",
            "PROTOCOL_IMMUTABLE",
        ));
    }
    let moves_port = update.port.is_some_and(|port| port != tunnel.port());
    if moves_port && !claims.has_perm(permissions::PORT_SELECT) {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            format!("Missing permission '{}'", permissions::PORT_SELECT),
            "FORBIDDEN",
        ));
    }
    if let Some(filter) = &update.filter {
        filter
            .validate()
            .map_err(|e| broker_error(BrokerError::InvalidFilter(e)))?;
    }

    if let Some(port) = update.port.filter(|_| moves_port) {
        state
            .broker
            .update_port(&claims.name, &token, port)
            .await
            .map_err(broker_error)?;
    }
    if let Some(filter) = update.filter {
        if filter != tunnel.filter() {
            state
                .broker
                .update_filter(&claims.name, &token, filter)
                .await
                .map_err(broker_error)?;
        }
    }
    if update.name.is_some() {
        state
            .broker
            .rename(&claims.name, &token, update.name)
            .await
            .map_err(broker_error)?;
    }

    debug!("Updated tunnel on port {}", tunnel.port());
    Ok(Json(tunnel.info()))
}

pub async fn get_port(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(token): Path<String>,
) -> ApiResult<PortBody> {
    let tunnel = state
        .broker
        .get(&claims.name, &token)
        .await
        .map_err(broker_error)?;
    Ok(Json(PortBody {
        port: tunnel.port(),
    }))
}

pub async fn get_protocol(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(token): Path<String>,
) -> ApiResult<ProtocolBody> {
    let tunnel = state
        .broker
        .get(&claims.name, &token)
        .await
        .map_err(broker_error)?;
    Ok(Json(ProtocolBody {
        protocol: tunnel.protocol(),
    }))
}

pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(token): Path<String>,
) -> ApiResult<UserBody> {
    let tunnel = state
        .broker
        .get(&claims.name, &token)
        .await
        .map_err(broker_error)?;
    Ok(Json(UserBody {
        user: tunnel.owner().to_string(),
    }))
}

pub async fn get_name(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(token): Path<String>,
) -> ApiResult<NameBody> {
    let tunnel = state
        .broker
        .get(&claims.name, &token)
        .await
        .map_err(broker_error)?;
    Ok(Json(NameBody {
        name: tunnel.name(),
    }))
}

pub async fn update_name(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(token): Path<String>,
    Json(body): Json<NameBody>,
) -> ApiResult<NameBody> {
    state
        .broker
        .rename(&claims.name, &token, body.name.clone())
        .await
        .map_err(broker_error)?;
    Ok(Json(body))
}

pub async fn get_filter(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(token): Path<String>,
) -> ApiResult<FilterBody> {
    let tunnel = state
        .broker
        .get(&claims.name, &token)
        .await
        .map_err(broker_error)?;
    Ok(Json(FilterBody {
        filter: tunnel.filter(),
    }))
}

pub async fn update_filter(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(token): Path<String>,
    Json(body): Json<FilterBody>,
) -> ApiResult<FilterBody> {
    let closed = state
        .broker
        .update_filter(&claims.name, &token, body.filter.clone())
        .await
        .map_err(broker_error)?;
    debug!("Filter update closed {} connection(s)", closed);
    Ok(Json(body))
}

/// Port range and every port currently held
pub async fn usage(State(state): State<Arc<AppState>>) -> Json<UsageResponse> {
    Json(UsageResponse {
        port: state.broker.usage(),
    })
}
