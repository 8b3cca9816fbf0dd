//! Geocoding API

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::IntoParams;

use crate::api::middleware::Authenticated;
use crate::domain::catalogue;
use crate::error::{DotMacError, Result};
use crate::service::{GeoPoint, GeocodingService, ReverseGeocode};

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct GeocodeQuery {
    /// Free-form address, components separated by commas
    pub address: String,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ReverseQuery {
    pub lat: f64,
    pub lon: f64,
}

/// Geo service state
#[derive(Clone)]
pub struct GeoState {
    pub geocoding: Arc<GeocodingService>,
}

/// Resolve an address to coordinates
#[utoipa::path(
    get,
    path = "/api/v1/geo/geocode",
    tag = "geo",
    params(GeocodeQuery),
    responses(
        (status = 200, description = "Best match", body = GeoPoint),
        (status = 404, description = "No match for any address variant"),
        (status = 502, description = "Nominatim unavailable")
    ),
    security(("bearer_auth" = []))
)]
pub async fn geocode(
    State(state): State<GeoState>,
    auth: Authenticated,
    Query(query): Query<GeocodeQuery>,
) -> Result<Json<GeoPoint>> {
    auth.0.require(catalogue::GEO_READ)?;
    state
        .geocoding
        .geocode(&query.address)
        .await?
        .map(Json)
        .ok_or_else(|| DotMacError::not_found("Location", query.address.trim()))
}

/// Resolve coordinates to an address
#[utoipa::path(
    get,
    path = "/api/v1/geo/reverse",
    tag = "geo",
    params(ReverseQuery),
    responses(
        (status = 200, description = "Address found", body = ReverseGeocode),
        (status = 400, description = "Coordinates out of range"),
        (status = 404, description = "Nothing at these coordinates")
    ),
    security(("bearer_auth" = []))
)]
pub async fn reverse(
    State(state): State<GeoState>,
    auth: Authenticated,
    Query(query): Query<ReverseQuery>,
) -> Result<Json<ReverseGeocode>> {
    auth.0.require(catalogue::GEO_READ)?;
    state
        .geocoding
        .reverse(query.lat, query.lon)
        .await?
        .map(Json)
        .ok_or_else(|| DotMacError::not_found("Location", format!("{},{}", query.lat, query.lon)))
}

/// Create geo router
pub fn geo_router(state: GeoState) -> Router {
    Router::new()
        .route("/geocode", get(geocode))
        .route("/reverse", get(reverse))
        .with_state(state)
}
