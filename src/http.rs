//! HTTP surface over [`ProximityService`].

use crate::engine::{DEFAULT_RADIUS_M, NearbyHit, NearbyQuery};
use crate::error::ProximityError;
use crate::reconcile::SyncReport;
use crate::service::ProximityService;
use crate::types::{Business, BusinessDraft, BusinessId, BusinessUpdate, Category};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

type AppState = Arc<ProximityService>;

const EMPTY_RESULT_MESSAGE: &str = "No businesses found. Try searching with a wider radius.";

pub fn router(service: AppState) -> Router {
    let request_timeout = service.config().server.request_timeout();

    Router::new()
        .route("/v1/search/nearby", get(search_nearby))
        .route("/v1/businesses", post(create_business))
        .route("/v1/businesses/seed", post(seed_businesses))
        .route(
            "/v1/businesses/:id",
            get(get_business).put(update_business).delete(delete_business),
        )
        .route("/v1/admin/sync/full", post(full_sync))
        .route("/v1/admin/sync/consistency-check", post(consistency_check))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&service), admit))
        .route("/health", get(health))
        .layer(
            ServiceBuilder::new()
                .layer(DefaultBodyLimit::max(8 * 1024 * 1024))
                .layer(TimeoutLayer::new(request_timeout)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Shed load before any handler work happens
async fn admit(State(service): State<AppState>, request: Request, next: Next) -> Response {
    match service.admission().acquire().await {
        Ok(_permit) => next.run(request).await,
        Err(e) => ApiError(e).into_response(),
    }
}

// ---- errors ----

/// A [`ProximityError`] rendered as a JSON error body
#[derive(Debug)]
pub struct ApiError(pub ProximityError);

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl From<ProximityError> for ApiError {
    fn from(err: ProximityError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(ProximityError::validation("body", rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError(ProximityError::validation("query", rejection.body_text()))
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            ProximityError::Validation { .. } | ProximityError::InvalidGeohash(_) => {
                StatusCode::BAD_REQUEST
            }
            ProximityError::NotFound(_) => StatusCode::NOT_FOUND,
            ProximityError::VersionConflict { .. } | ProximityError::ReconcileInProgress => {
                StatusCode::CONFLICT
            }
            ProximityError::Overloaded | ProximityError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            ProximityError::DownstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match &self.0 {
            ProximityError::Validation { .. } | ProximityError::InvalidGeohash(_) => {
                "VALIDATION_ERROR"
            }
            ProximityError::NotFound(_) => "NOT_FOUND",
            ProximityError::VersionConflict { .. } => "VERSION_CONFLICT",
            ProximityError::ReconcileInProgress => "SYNC_IN_PROGRESS",
            ProximityError::Overloaded => "OVERLOADED",
            ProximityError::Closed => "UNAVAILABLE",
            ProximityError::DownstreamTimeout { .. } => "DOWNSTREAM_TIMEOUT",
            _ => "INTERNAL_ERROR",
        }
    }

    fn details(&self) -> Option<Value> {
        match &self.0 {
            ProximityError::Validation { field, .. } => Some(json!({ "field": field })),
            ProximityError::VersionConflict {
                expected, actual, ..
            } => Some(json!({ "expected_version": expected, "current_version": actual })),
            ProximityError::DownstreamTimeout { component } => {
                Some(json!({ "component": component.to_string() }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(error = %self.0, "request failed");
            match &self.0 {
                ProximityError::DownstreamTimeout { .. } => self.0.to_string(),
                _ => "An internal error occurred".to_string(),
            }
        } else {
            tracing::debug!(error = %self.0, "client error");
            self.0.to_string()
        };

        let body = ErrorResponse {
            error: self.error_type(),
            message,
            details: self.details(),
        };
        (status, Json(body)).into_response()
    }
}

// ---- DTOs ----

/// Body of create, update and seed requests
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BusinessRequest {
    pub name: String,
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub category: Option<String>,
    pub phone: Option<String>,
    pub hours: Option<String>,
    /// Expected current version, for compare-and-swap updates
    pub version: Option<u64>,
}

impl BusinessRequest {
    fn into_draft(self) -> Result<(BusinessDraft, Option<u64>), ProximityError> {
        let latitude = self
            .latitude
            .ok_or_else(|| ProximityError::validation("latitude", "is required"))?;
        let longitude = self
            .longitude
            .ok_or_else(|| ProximityError::validation("longitude", "is required"))?;
        let category: Category = self
            .category
            .ok_or_else(|| ProximityError::validation("category", "is required"))?
            .parse()?;

        let draft = BusinessDraft {
            name: self.name,
            address: self.address,
            latitude,
            longitude,
            category,
            phone: self.phone,
            hours: self.hours,
        };
        Ok((draft, self.version))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BusinessResponse {
    pub id: BusinessId,
    pub name: String,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub category: Category,
    pub phone: Option<String>,
    pub hours: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Business> for BusinessResponse {
    fn from(b: Business) -> Self {
        Self {
            id: b.id,
            name: b.name,
            address: b.address,
            latitude: b.latitude,
            longitude: b.longitude,
            category: b.category,
            phone: b.phone,
            hours: b.hours,
            version: b.version,
            created_at: b.created_at,
            updated_at: b.updated_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NearbyParams {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub radius: Option<f64>,
    pub limit: Option<usize>,
    pub category: Option<String>,
}

impl NearbyParams {
    fn into_query(self) -> Result<NearbyQuery, ProximityError> {
        let latitude = self
            .latitude
            .ok_or_else(|| ProximityError::validation("latitude", "is required"))?;
        let longitude = self
            .longitude
            .ok_or_else(|| ProximityError::validation("longitude", "is required"))?;

        let mut query = NearbyQuery::new(latitude, longitude, self.radius.unwrap_or(DEFAULT_RADIUS_M));
        if let Some(category) = self.category {
            query = query.with_category(category.parse()?);
        }
        if let Some(limit) = self.limit {
            query = query.with_limit(limit);
        }
        Ok(query)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NearbyBusiness {
    pub id: BusinessId,
    pub name: String,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub distance_m: f64,
    pub category: Category,
}

impl From<NearbyHit> for NearbyBusiness {
    fn from(hit: NearbyHit) -> Self {
        let b = hit.business;
        Self {
            id: b.id,
            name: b.name,
            address: b.address,
            latitude: b.latitude,
            longitude: b.longitude,
            distance_m: (hit.distance_m * 10.0).round() / 10.0,
            category: b.category,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NearbyResponse {
    pub total: usize,
    pub businesses: Vec<NearbyBusiness>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SeedResponse {
    pub created_count: usize,
    pub ids: Vec<BusinessId>,
}

// ---- handlers ----

fn parse_id(raw: &str) -> Result<BusinessId, ApiError> {
    Ok(raw.parse()?)
}

async fn search_nearby(
    State(service): State<AppState>,
    params: Result<Query<NearbyParams>, QueryRejection>,
) -> Result<Json<NearbyResponse>, ApiError> {
    let Query(params) = params?;
    let query = params.into_query()?;
    let hits = service.reads().nearby(&query).await?;

    let businesses: Vec<NearbyBusiness> = hits.into_iter().map(NearbyBusiness::from).collect();
    let message = businesses.is_empty().then(|| EMPTY_RESULT_MESSAGE.to_string());
    Ok(Json(NearbyResponse {
        total: businesses.len(),
        businesses,
        message,
    }))
}

async fn get_business(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BusinessResponse>, ApiError> {
    let id = parse_id(&id)?;
    let business = service.reads().get(&id).await?;
    Ok(Json(business.into()))
}

async fn create_business(
    State(service): State<AppState>,
    body: Result<Json<BusinessRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<BusinessResponse>), ApiError> {
    let Json(request) = body?;
    let (draft, _) = request.into_draft()?;
    let business = service.writes().create(draft).await?;
    Ok((StatusCode::CREATED, Json(business.into())))
}

async fn update_business(
    State(service): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<BusinessRequest>, JsonRejection>,
) -> Result<Json<BusinessResponse>, ApiError> {
    let id = parse_id(&id)?;
    let Json(request) = body?;
    let (draft, expected) = request.into_draft()?;

    let mut update = BusinessUpdate::new(draft);
    if let Some(version) = expected {
        update = update.expecting(version);
    }
    let business = service.writes().update(id, update).await?;
    Ok(Json(business.into()))
}

async fn delete_business(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    service.writes().delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn seed_businesses(
    State(service): State<AppState>,
    body: Result<Json<Vec<BusinessRequest>>, JsonRejection>,
) -> Result<(StatusCode, Json<SeedResponse>), ApiError> {
    let Json(requests) = body?;
    let drafts = requests
        .into_iter()
        .enumerate()
        .map(|(position, r)| {
            r.into_draft()
                .map(|(draft, _)| draft)
                .map_err(|e| e.at_item(position))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let created = service.writes().seed(drafts).await?;
    Ok((
        StatusCode::CREATED,
        Json(SeedResponse {
            created_count: created.len(),
            ids: created.into_iter().map(|b| b.id).collect(),
        }),
    ))
}

async fn full_sync(State(service): State<AppState>) -> Result<Json<SyncReport>, ApiError> {
    Ok(Json(service.reconciler().full_sync().await?))
}

async fn consistency_check(State(service): State<AppState>) -> Result<Json<SyncReport>, ApiError> {
    Ok(Json(service.reconciler().consistency_check().await?))
}

async fn health(State(service): State<AppState>) -> Json<Value> {
    let indexed = service.index().len().unwrap_or_default();
    Json(json!({
        "status": "ok",
        "indexed": indexed,
        "in_flight": service.admission().in_flight(),
        "pending_repairs": service.inconsistencies().len(),
    }))
}
