//! HTTP server for the broker API.
//!
//! Serves the user-facing REST API under `/api` and the federation endpoint
//! used by peer providers at `/federation`. Callers are identified by the
//! `X-User-Id`, `X-User-Name` and `X-Identity-Provider` headers, which an
//! authenticating proxy in front of the broker is expected to set.

use axum::{
	extract::{DefaultBodyLimit, FromRequestParts, Path, Query, State},
	http::{request::Parts, StatusCode},
	response::{IntoResponse, Json, Response},
	routing::{delete, get, post},
	Router,
};
use broker_config::{ApiConfig, Config};
use broker_core::{BrokerEngine, BrokerError};
use broker_types::{
	ComputeActionRequest, CreateOrderRequest, CreateOrderResponse, ErrorCondition, ErrorResponse,
	FederationEnvelope, FederationReply, Image, ImageSummary, InstanceStatus, OrderView, Quota,
	ResourceAmounts, ResourceType, SecurityRule, SecurityRuleCreated, SecurityRuleInstance,
	SnapshotRequest, SnapshotResponse, SystemUser,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

const USER_ID_HEADER: &str = "x-user-id";
const USER_NAME_HEADER: &str = "x-user-name";
const IDENTITY_PROVIDER_HEADER: &str = "x-identity-provider";
const DEFAULT_IDENTITY_PROVIDER: &str = "local";

/// Shared application state for the API server.
#[derive(Clone)]
pub struct AppState {
	pub engine: Arc<BrokerEngine>,
	/// File re-read by the reload endpoint.
	pub config_path: Option<PathBuf>,
}

/// Error returned by a handler, rendered as `{error, message}`.
#[derive(Debug)]
pub struct ApiError {
	condition: ErrorCondition,
	message: String,
}

impl ApiError {
	fn new(condition: ErrorCondition, message: impl Into<String>) -> Self {
		Self {
			condition,
			message: message.into(),
		}
	}
}

impl From<BrokerError> for ApiError {
	fn from(err: BrokerError) -> Self {
		Self::new(err.condition(), err.to_string())
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = StatusCode::from_u16(self.condition.status_code())
			.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
		let body = ErrorResponse {
			error: self.condition.as_str().to_string(),
			message: self.message,
		};
		(status, Json(body)).into_response()
	}
}

/// The authenticated caller of a request.
pub struct Caller(pub SystemUser);

impl<S> FromRequestParts<S> for Caller
where
	S: Send + Sync,
{
	type Rejection = ApiError;

	async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
		let header = |name: &str| {
			parts
				.headers
				.get(name)
				.and_then(|value| value.to_str().ok())
				.map(str::trim)
				.filter(|value| !value.is_empty())
				.map(str::to_string)
		};
		let id = header(USER_ID_HEADER).ok_or_else(|| {
			ApiError::new(ErrorCondition::Unauthenticated, "missing user identity")
		})?;
		let name = header(USER_NAME_HEADER).unwrap_or_else(|| id.clone());
		let identity_provider =
			header(IDENTITY_PROVIDER_HEADER).unwrap_or_else(|| DEFAULT_IDENTITY_PROVIDER.into());
		Ok(Caller(SystemUser::new(id, name, identity_provider)))
	}
}

/// Provider and cloud an operation targets; the local default when omitted.
#[derive(Debug, Default, Deserialize)]
pub struct Target {
	pub provider: Option<String>,
	pub cloud: Option<String>,
}

fn parse_resource_type(value: &str) -> Result<ResourceType, ApiError> {
	value
		.parse()
		.map_err(|e: String| ApiError::new(ErrorCondition::BadRequest, e))
}

/// Builds the router with all routes and middleware.
pub fn router(state: AppState, max_request_size: usize) -> Router {
	let api = Router::new()
		.route("/orders", post(handle_create_order))
		.route("/orders/{resource_type}", get(handle_list_orders))
		.route(
			"/orders/{resource_type}/{order_id}",
			get(handle_get_order).delete(handle_delete_order),
		)
		.route(
			"/orders/{resource_type}/{order_id}/security-rules",
			post(handle_create_security_rule).get(handle_get_security_rules),
		)
		.route(
			"/orders/{resource_type}/{order_id}/security-rules/{rule_id}",
			delete(handle_delete_security_rule),
		)
		.route("/compute/{order_id}/actions", post(handle_compute_action))
		.route("/compute/{order_id}/snapshots", post(handle_snapshot))
		.route("/quota/{resource_type}", get(handle_quota))
		.route("/allocation/{resource_type}", get(handle_allocation))
		.route("/images", get(handle_images))
		.route("/images/{image_id}", get(handle_image))
		.route("/clouds", get(handle_cloud_names))
		.route("/admin/reload", post(handle_reload));

	Router::new()
		.nest("/api", api)
		.route("/federation", post(handle_federation))
		.layer(
			ServiceBuilder::new()
				.layer(TraceLayer::new_for_http())
				.layer(CorsLayer::permissive())
				.layer(DefaultBodyLimit::max(max_request_size)),
		)
		.with_state(state)
}

/// Starts the HTTP server and serves until the listener fails.
pub async fn start_server(
	api_config: ApiConfig,
	engine: Arc<BrokerEngine>,
	config_path: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
	let state = AppState {
		engine,
		config_path,
	};
	let app = router(state, api_config.max_request_size);

	let bind_address = format!("{}:{}", api_config.host, api_config.port);
	let listener = TcpListener::bind(&bind_address).await?;
	tracing::info!(address = %bind_address, "Broker API server starting");

	axum::serve(listener, app).await?;
	Ok(())
}

async fn handle_create_order(
	State(state): State<AppState>,
	Caller(user): Caller,
	Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), ApiError> {
	let id = state.engine.application().create_order(&user, request).await?;
	Ok((StatusCode::CREATED, Json(CreateOrderResponse { id })))
}

async fn handle_list_orders(
	State(state): State<AppState>,
	Caller(user): Caller,
	Path(resource_type): Path<String>,
) -> Result<Json<Vec<InstanceStatus>>, ApiError> {
	let resource_type = parse_resource_type(&resource_type)?;
	let statuses = state
		.engine
		.application()
		.get_all_instances_status(&user, resource_type)
		.await?;
	Ok(Json(statuses))
}

async fn handle_get_order(
	State(state): State<AppState>,
	Caller(user): Caller,
	Path((resource_type, order_id)): Path<(String, String)>,
) -> Result<Json<OrderView>, ApiError> {
	let resource_type = parse_resource_type(&resource_type)?;
	let view = state
		.engine
		.application()
		.get_order(&user, &order_id, resource_type)
		.await?;
	Ok(Json(view))
}

async fn handle_delete_order(
	State(state): State<AppState>,
	Caller(user): Caller,
	Path((resource_type, order_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
	let resource_type = parse_resource_type(&resource_type)?;
	state
		.engine
		.application()
		.delete_order(&user, &order_id, resource_type)
		.await?;
	Ok(StatusCode::NO_CONTENT)
}

async fn handle_create_security_rule(
	State(state): State<AppState>,
	Caller(user): Caller,
	Path((resource_type, order_id)): Path<(String, String)>,
	Json(rule): Json<SecurityRule>,
) -> Result<(StatusCode, Json<SecurityRuleCreated>), ApiError> {
	let resource_type = parse_resource_type(&resource_type)?;
	let id = state
		.engine
		.application()
		.create_security_rule(&user, &order_id, resource_type, rule)
		.await?;
	Ok((StatusCode::CREATED, Json(SecurityRuleCreated { id })))
}

async fn handle_get_security_rules(
	State(state): State<AppState>,
	Caller(user): Caller,
	Path((resource_type, order_id)): Path<(String, String)>,
) -> Result<Json<Vec<SecurityRuleInstance>>, ApiError> {
	let resource_type = parse_resource_type(&resource_type)?;
	let rules = state
		.engine
		.application()
		.get_security_rules(&user, &order_id, resource_type)
		.await?;
	Ok(Json(rules))
}

async fn handle_delete_security_rule(
	State(state): State<AppState>,
	Caller(user): Caller,
	Path((resource_type, order_id, rule_id)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
	let resource_type = parse_resource_type(&resource_type)?;
	state
		.engine
		.application()
		.delete_security_rule(&user, &order_id, resource_type, &rule_id)
		.await?;
	Ok(StatusCode::NO_CONTENT)
}

async fn handle_compute_action(
	State(state): State<AppState>,
	Caller(user): Caller,
	Path(order_id): Path<String>,
	Json(request): Json<ComputeActionRequest>,
) -> Result<StatusCode, ApiError> {
	state
		.engine
		.application()
		.perform_compute_action(&user, &order_id, request.action)
		.await?;
	Ok(StatusCode::NO_CONTENT)
}

async fn handle_snapshot(
	State(state): State<AppState>,
	Caller(user): Caller,
	Path(order_id): Path<String>,
	Json(request): Json<SnapshotRequest>,
) -> Result<(StatusCode, Json<SnapshotResponse>), ApiError> {
	let image_id = state
		.engine
		.application()
		.take_snapshot(&user, &order_id, &request.name)
		.await?;
	Ok((StatusCode::CREATED, Json(SnapshotResponse { image_id })))
}

async fn handle_quota(
	State(state): State<AppState>,
	Caller(user): Caller,
	Path(resource_type): Path<String>,
	Query(target): Query<Target>,
) -> Result<Json<Quota>, ApiError> {
	let resource_type = parse_resource_type(&resource_type)?;
	let quota = state
		.engine
		.application()
		.get_user_quota(
			&user,
			target.provider.as_deref(),
			target.cloud.as_deref(),
			resource_type,
		)
		.await?;
	Ok(Json(quota))
}

async fn handle_allocation(
	State(state): State<AppState>,
	Caller(user): Caller,
	Path(resource_type): Path<String>,
	Query(target): Query<Target>,
) -> Result<Json<ResourceAmounts>, ApiError> {
	let resource_type = parse_resource_type(&resource_type)?;
	let allocation = state
		.engine
		.application()
		.get_user_allocation(
			&user,
			target.provider.as_deref(),
			target.cloud.as_deref(),
			resource_type,
		)
		.await?;
	Ok(Json(allocation))
}

async fn handle_images(
	State(state): State<AppState>,
	Caller(user): Caller,
	Query(target): Query<Target>,
) -> Result<Json<Vec<ImageSummary>>, ApiError> {
	let images = state
		.engine
		.application()
		.get_all_images(&user, target.provider.as_deref(), target.cloud.as_deref())
		.await?;
	Ok(Json(images))
}

async fn handle_image(
	State(state): State<AppState>,
	Caller(user): Caller,
	Path(image_id): Path<String>,
	Query(target): Query<Target>,
) -> Result<Json<Image>, ApiError> {
	let image = state
		.engine
		.application()
		.get_image(
			&user,
			target.provider.as_deref(),
			target.cloud.as_deref(),
			&image_id,
		)
		.await?;
	Ok(Json(image))
}

async fn handle_cloud_names(
	State(state): State<AppState>,
	Caller(user): Caller,
	Query(target): Query<Target>,
) -> Result<Json<Vec<String>>, ApiError> {
	let names = state
		.engine
		.application()
		.get_cloud_names(&user, target.provider.as_deref())
		.await?;
	Ok(Json(names))
}

/// Handles POST /api/admin/reload by re-reading the configuration file.
async fn handle_reload(
	State(state): State<AppState>,
	Caller(user): Caller,
) -> Result<StatusCode, ApiError> {
	let path = state.config_path.as_ref().ok_or_else(|| {
		ApiError::new(
			ErrorCondition::Conflict,
			"broker was not started from a configuration file",
		)
	})?;
	let path = path.to_string_lossy();
	let config = Config::from_file(&path).await.map_err(|e| {
		tracing::warn!(path = %path, error = %e, "Reload rejected");
		ApiError::new(ErrorCondition::BadRequest, e.to_string())
	})?;

	state.engine.reload(&user, config).await?;
	Ok(StatusCode::NO_CONTENT)
}

/// Handles POST /federation from peer providers.
///
/// Always answers 200; failures travel inside the reply.
async fn handle_federation(
	State(state): State<AppState>,
	Json(envelope): Json<FederationEnvelope>,
) -> Json<FederationReply> {
	let requester = envelope.requesting_provider.clone();
	let operation = envelope.request.operation();
	let result = state.engine.remote().handle(envelope).await;
	if let Err(e) = &result {
		tracing::debug!(requester = %requester, operation, error = %e, "Federation request failed");
	}
	Json(result.into())
}
