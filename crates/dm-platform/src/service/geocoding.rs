//! Geocoding Service
//!
//! Nominatim client with progressive address fallback, a global request
//! throttle and result caching.

use dm_config::GeoSettings;
use governor::{clock::DefaultClock, state::{InMemoryState, NotKeyed}, Quota, RateLimiter};
use nonzero_ext::nonzero;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use utoipa::ToSchema;

use crate::error::{DotMacError, Result};
use crate::infra::cache::{get_json, set_json, CacheBackend};

const SERVICE: &str = "nominatim";
/// Fallback stops once the address is down to this many components
const MIN_FALLBACK_COMPONENTS: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub display_name: String,
    /// The address variant that produced the hit
    pub matched_query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReverseGeocode {
    pub display_name: String,
    pub address: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct ReverseHit {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    address: BTreeMap<String, serde_json::Value>,
}

/// Full address first, then dropping leading components. Addresses with
/// one component are tried as-is only.
pub fn fallback_queries(address: &str) -> Vec<String> {
    let parts: Vec<&str> = address
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        return Vec::new();
    }

    let mut queries = vec![parts.join(", ")];
    let mut start = 1;
    while parts.len() - start >= MIN_FALLBACK_COMPONENTS {
        queries.push(parts[start..].join(", "));
        start += 1;
    }
    queries
}

pub struct GeocodingService {
    client: reqwest::Client,
    base_url: String,
    throttle: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    cache: Arc<dyn CacheBackend>,
    cache_ttl: Duration,
}

impl GeocodingService {
    pub fn new(settings: &GeoSettings, cache: Arc<dyn CacheBackend>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()
            .map_err(|e| DotMacError::internal(format!("Failed to build HTTP client: {}", e)))?;
        let rate = NonZeroU32::new(settings.requests_per_second).unwrap_or(nonzero!(1u32));

        Ok(Self {
            client,
            base_url: settings.nominatim_url.trim_end_matches('/').to_string(),
            throttle: RateLimiter::direct(Quota::per_second(rate)),
            cache,
            cache_ttl: Duration::from_secs(settings.cache_ttl_secs),
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        self.throttle.until_ready().await;
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| DotMacError::external(SERVICE, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DotMacError::external(SERVICE, format!("HTTP {}", status)));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| DotMacError::external(SERVICE, format!("Malformed response: {}", e)))
    }

    async fn search(&self, query: &str) -> Result<Option<GeoPoint>> {
        let hits: Vec<SearchHit> = self
            .get_json(
                "/search",
                &[
                    ("q", query.to_string()),
                    ("format", "json".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;

        let Some(hit) = hits.into_iter().next() else {
            return Ok(None);
        };
        let (Ok(latitude), Ok(longitude)) = (hit.lat.parse::<f64>(), hit.lon.parse::<f64>()) else {
            warn!(query, "Nominatim returned unparseable coordinates");
            return Ok(None);
        };
        Ok(Some(GeoPoint {
            latitude,
            longitude,
            display_name: hit.display_name,
            matched_query: query.to_string(),
        }))
    }

    /// Resolve an address, retrying with shorter variants until one hits
    pub async fn geocode(&self, address: &str) -> Result<Option<GeoPoint>> {
        let queries = fallback_queries(address);
        let Some(full) = queries.first() else {
            return Err(DotMacError::field("address", "Address must not be empty"));
        };

        let cache_key = format!("geo:search:{}", full.to_lowercase());
        if let Some(cached) = get_json::<Option<GeoPoint>>(self.cache.as_ref(), &cache_key).await? {
            debug!(address = %full, "Geocode cache hit");
            return Ok(cached);
        }

        let mut result = None;
        for query in &queries {
            if let Some(point) = self.search(query).await? {
                result = Some(point);
                break;
            }
            debug!(query = %query, "No geocode match, trying shorter address");
        }

        set_json(self.cache.as_ref(), &cache_key, &result, self.cache_ttl).await?;
        Ok(result)
    }

    pub async fn reverse(&self, latitude: f64, longitude: f64) -> Result<Option<ReverseGeocode>> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(DotMacError::field("lat", "Latitude must be between -90 and 90"));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(DotMacError::field("lon", "Longitude must be between -180 and 180"));
        }

        let cache_key = format!("geo:reverse:{:.6},{:.6}", latitude, longitude);
        if let Some(cached) = get_json::<Option<ReverseGeocode>>(self.cache.as_ref(), &cache_key).await? {
            return Ok(cached);
        }

        let hit: ReverseHit = self
            .get_json(
                "/reverse",
                &[
                    ("lat", latitude.to_string()),
                    ("lon", longitude.to_string()),
                    ("format", "json".to_string()),
                ],
            )
            .await?;

        let result = match (hit.error, hit.display_name) {
            (Some(error), _) => {
                debug!(latitude, longitude, error = %error, "Reverse geocode found nothing");
                None
            }
            (None, Some(display_name)) => Some(ReverseGeocode {
                display_name,
                address: hit
                    .address
                    .into_iter()
                    .map(|(k, v)| match v {
                        serde_json::Value::String(s) => (k, s),
                        other => (k, other.to_string()),
                    })
                    .collect(),
            }),
            (None, None) => None,
        };

        set_json(self.cache.as_ref(), &cache_key, &result, self.cache_ttl).await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::cache::MemoryCache;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service(server: &MockServer) -> GeocodingService {
        let settings = GeoSettings {
            nominatim_url: server.uri(),
            user_agent: "dotmac-test/1.0".to_string(),
            requests_per_second: 100,
            cache_ttl_secs: 60,
            timeout_secs: 5,
        };
        GeocodingService::new(&settings, Arc::new(MemoryCache::new())).unwrap()
    }

    #[test]
    fn test_fallback_queries() {
        assert_eq!(
            fallback_queries("12 Main St, Springfield, IL, USA"),
            vec![
                "12 Main St, Springfield, IL, USA",
                "Springfield, IL, USA",
                "IL, USA",
            ]
        );
        assert_eq!(fallback_queries(" Lagos "), vec!["Lagos"]);
        assert_eq!(fallback_queries("Ikeja,  , Lagos"), vec!["Ikeja, Lagos"]);
        assert!(fallback_queries(" , ").is_empty());
    }

    #[tokio::test]
    async fn test_geocode_falls_back_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "Springfield, IL, USA"))
            .and(header("user-agent", "dotmac-test/1.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"lat": "39.7817", "lon": "-89.6501", "display_name": "Springfield, Illinois"}
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let geo = service(&server);
        let point = geo
            .geocode("12 Main St, Springfield, IL, USA")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(point.matched_query, "Springfield, IL, USA");
        assert!((point.latitude - 39.7817).abs() < 1e-9);

        // Served from cache; the expect(1) above verifies on drop
        let again = geo.geocode("12 Main St, Springfield, IL, USA").await.unwrap();
        assert_eq!(again, Some(point));
    }

    #[tokio::test]
    async fn test_geocode_no_match() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(2)
            .mount(&server)
            .await;

        let geo = service(&server);
        assert_eq!(geo.geocode("1 Nowhere Lane, Atlantis, Ocean").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_geocode_rejects_empty() {
        let server = MockServer::start().await;
        let geo = service(&server);
        assert!(matches!(
            geo.geocode("   ").await,
            Err(DotMacError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_upstream_failure_is_external_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let geo = service(&server);
        assert!(matches!(
            geo.geocode("Lagos").await,
            Err(DotMacError::ExternalService { .. })
        ));
    }

    #[tokio::test]
    async fn test_reverse() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reverse"))
            .and(query_param("lat", "6.5244"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "display_name": "Lagos, Nigeria",
                "address": {"city": "Lagos", "country": "Nigeria", "country_code": "ng"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/reverse"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": "Unable to geocode"
            })))
            .mount(&server)
            .await;

        let geo = service(&server);
        let place = geo.reverse(6.5244, 3.3792).await.unwrap().unwrap();
        assert_eq!(place.display_name, "Lagos, Nigeria");
        assert_eq!(place.address.get("city").map(String::as_str), Some("Lagos"));

        assert_eq!(geo.reverse(0.0, 0.0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reverse_validates_ranges() {
        let server = MockServer::start().await;
        let geo = service(&server);
        assert!(geo.reverse(91.0, 0.0).await.is_err());
        assert!(geo.reverse(0.0, -180.5).await.is_err());
    }
}
