use crate::cache::ApiCache;
use crate::config::Config;
use crate::gps::limiter::FixedWindowLimiter;
use crate::gps::provider::Provider;
use chrono::{DateTime, Utc};
use models::gps::GpsFix;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

const TOKEN_CACHE_KEY: &str = "compass:token";
const MODEMS_CACHE_KEY: &str = "compass:modems";

pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
pub const RATE_LIMIT_CAP: u32 = 30;

#[derive(Debug, thiserror::Error)]
pub enum GpsError {
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("upstream returned status {status}")]
    Upstream { status: u16 },
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// One entry of the Compass service catalog: a modem and the network
/// provider it belongs to. The provider is kept as the raw catalog string;
/// resolution to a [`Provider`] happens at fetch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemListing {
    pub id: String,
    pub provider: String,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access_token: String,
}

/// Authenticated client for the Compass API. Owns the outbound rate limiter:
/// every GPS request, including retries, counts against the fixed window and
/// a local rejection never reaches the network.
#[derive(Debug)]
pub struct CompassClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    company_id: String,
    limiter: FixedWindowLimiter,
}

impl CompassClient {
    pub fn new(
        base_url: String,
        api_key: String,
        api_secret: String,
        company_id: String,
        limiter: FixedWindowLimiter,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(CompassClient {
            http,
            base_url,
            api_key,
            api_secret,
            company_id,
            limiter,
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        CompassClient::new(
            config.compass_api_url.clone(),
            config.compass_api_key.clone(),
            config.compass_api_secret.clone(),
            config.compass_company_id.clone(),
            FixedWindowLimiter::new(RATE_LIMIT_WINDOW, RATE_LIMIT_CAP),
        )
    }

    /// Exchanges the configured credentials for a bearer token.
    pub async fn authenticate(&self) -> Result<String, GpsError> {
        let response = self
            .http
            .post(format!("{}/auth", self.base_url))
            .json(&json!({ "key": self.api_key, "secret": self.api_secret }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GpsError::Upstream {
                status: status.as_u16(),
            });
        }

        let auth: AuthResponse = response.json().await?;
        Ok(auth.access_token)
    }

    /// Full modem roster (id + provider) from the company's service catalog.
    pub async fn list_modems(&self, token: &str) -> Result<Vec<ModemListing>, GpsError> {
        let response = self
            .http
            .get(format!(
                "{}/companies/{}/services",
                self.base_url, self.company_id
            ))
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GpsError::Upstream {
                status: status.as_u16(),
            });
        }

        Ok(response.json().await?)
    }

    /// Fetches current fixes for a batch of modem ids on one provider.
    ///
    /// HTTP 429 responses are retried with the server-provided backoff
    /// (`Retry-After`, default 60s) up to three attempts; any other non-2xx
    /// or network failure propagates without retry. Entries the upstream
    /// returns in an unexpected shape are skipped, not an error.
    pub async fn fetch_gps(
        &self,
        provider: Provider,
        ids: &[String],
        token: &str,
    ) -> Result<HashMap<String, Vec<GpsFix>>, GpsError> {
        let url = format!("{}{}", self.base_url, provider.endpoint_path());

        let mut attempt = 0;
        loop {
            attempt += 1;

            if !self.limiter.try_acquire() {
                warn!(
                    provider = provider.as_str(),
                    "local rate limit reached, skipping gps request"
                );
                return Err(GpsError::RateLimited {
                    retry_after_secs: DEFAULT_RETRY_AFTER_SECS,
                });
            }

            let response = self
                .http
                .post(&url)
                .bearer_auth(token)
                .json(&json!({ "ids": ids }))
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after_secs = retry_after_secs(response.headers());
                if attempt >= MAX_ATTEMPTS {
                    return Err(GpsError::RateLimited { retry_after_secs });
                }
                warn!(
                    provider = provider.as_str(),
                    attempt, retry_after_secs, "gps endpoint rate limited, backing off"
                );
                tokio::time::sleep(Duration::from_secs(retry_after_secs)).await;
                continue;
            }
            if !status.is_success() {
                return Err(GpsError::Upstream {
                    status: status.as_u16(),
                });
            }

            let raw: HashMap<String, Vec<Value>> = response.json().await?;
            debug!(
                provider = provider.as_str(),
                modems = raw.len(),
                "gps payload received"
            );
            return Ok(raw
                .into_iter()
                .map(|(id, entries)| (id, entries.iter().filter_map(parse_fix).collect()))
                .collect());
        }
    }
}

/// Bearer token for Compass calls, cached between requests. A cache miss
/// (expiry, cold start, storage failure) re-authenticates.
pub async fn cached_token(client: &CompassClient, cache: &ApiCache) -> Result<String, GpsError> {
    if let Some(value) = cache.get(TOKEN_CACHE_KEY).await {
        if let Some(token) = value.as_str() {
            return Ok(token.to_string());
        }
    }
    let token = client.authenticate().await?;
    cache.set(TOKEN_CACHE_KEY, json!(token)).await;
    Ok(token)
}

/// Modem roster, cached between batch runs.
pub async fn cached_roster(
    client: &CompassClient,
    cache: &ApiCache,
) -> Result<Vec<ModemListing>, GpsError> {
    if let Some(value) = cache.get(MODEMS_CACHE_KEY).await {
        if let Ok(roster) = serde_json::from_value::<Vec<ModemListing>>(value) {
            return Ok(roster);
        }
    }
    let token = cached_token(client, cache).await?;
    let roster = client.list_modems(&token).await?;
    if let Ok(value) = serde_json::to_value(&roster) {
        cache.set(MODEMS_CACHE_KEY, value).await;
    }
    Ok(roster)
}

fn retry_after_secs(headers: &HeaderMap) -> u64 {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

/// Lenient fix parser: Compass sends lat/lon as numeric strings, but bare
/// numbers show up too. Anything without a parsable timestamp, lat and lon
/// is dropped.
fn parse_fix(entry: &Value) -> Option<GpsFix> {
    let timestamp = parse_timestamp(entry.get("timestamp")?)?;
    let lat = parse_coordinate(entry.get("lat")?)?;
    let lon = parse_coordinate(entry.get("lon")?)?;
    Some(GpsFix { timestamp, lat, lon })
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(text) = value.as_str() {
        return DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|ts| ts.with_timezone(&Utc));
    }
    DateTime::from_timestamp(value.as_i64()?, 0)
}

fn parse_coordinate(value: &Value) -> Option<f64> {
    match value {
        Value::String(text) => text.trim().parse().ok(),
        Value::Number(number) => number.as_f64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: &str, cap: u32) -> CompassClient {
        CompassClient::new(
            base_url.to_string(),
            "key".to_string(),
            "secret".to_string(),
            "acme".to_string(),
            FixedWindowLimiter::new(Duration::from_secs(60), cap),
        )
        .unwrap()
    }

    fn fix_payload() -> Value {
        json!({
            "modem-1": [
                { "timestamp": "2026-08-01T10:00:00Z", "lat": "55.6761", "lon": "12.5683" },
            ],
        })
    }

    #[tokio::test]
    async fn fetch_gps_posts_ids_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/starlinkgps"))
            .and(header("authorization", "Bearer tok"))
            .and(body_json(json!({ "ids": ["modem-1"] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(fix_payload()))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server.uri(), 30);
        let fixes = client
            .fetch_gps(Provider::Starlink, &["modem-1".to_string()], "tok")
            .await
            .unwrap();

        assert_eq!(fixes["modem-1"].len(), 1);
        assert_eq!(fixes["modem-1"][0].lat, 55.6761);
        assert_eq!(fixes["modem-1"][0].lon, 12.5683);
    }

    #[tokio::test]
    async fn retries_once_with_server_provided_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/idirectgps"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/idirectgps"))
            .respond_with(ResponseTemplate::new(200).set_body_json(fix_payload()))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server.uri(), 30);
        let started = std::time::Instant::now();
        let fixes = client
            .fetch_gps(Provider::Idirect, &["modem-1".to_string()], "tok")
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(fixes["modem-1"].len(), 1);
    }

    #[tokio::test]
    async fn surfaces_rate_limit_after_retry_ceiling() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/starlinkgps"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .expect(3)
            .mount(&server)
            .await;

        let client = client(&server.uri(), 30);
        let err = client
            .fetch_gps(Provider::Starlink, &["modem-1".to_string()], "tok")
            .await
            .unwrap_err();

        assert_matches!(
            err,
            GpsError::RateLimited {
                retry_after_secs: 0
            }
        );
    }

    #[tokio::test]
    async fn local_rate_limit_rejects_before_the_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(fix_payload()))
            .expect(0)
            .mount(&server)
            .await;

        let client = client(&server.uri(), 0);
        let err = client
            .fetch_gps(Provider::Starlink, &["modem-1".to_string()], "tok")
            .await
            .unwrap_err();

        assert_matches!(err, GpsError::RateLimited { .. });
    }

    #[tokio::test]
    async fn non_429_failures_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/newtecgps"))
            .respond_with(ResponseTemplate::new(502))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server.uri(), 30);
        let err = client
            .fetch_gps(Provider::Newtec, &["modem-1".to_string()], "tok")
            .await
            .unwrap_err();

        assert_matches!(err, GpsError::Upstream { status: 502 });
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped_not_fatal() {
        let server = MockServer::start().await;
        let payload = json!({
            "modem-1": [
                { "timestamp": "2026-08-01T10:00:00Z", "lat": "55.0", "lon": "12.0" },
                { "timestamp": "2026-08-01T11:00:00Z", "lat": "55.1" },
                { "timestamp": "not-a-date", "lat": "55.2", "lon": "12.2" },
                { "timestamp": "2026-08-01T12:00:00Z", "lat": 55.3, "lon": 12.3 },
            ],
        });
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(payload))
            .mount(&server)
            .await;

        let client = client(&server.uri(), 30);
        let fixes = client
            .fetch_gps(Provider::Starlink, &["modem-1".to_string()], "tok")
            .await
            .unwrap();

        let parsed = &fixes["modem-1"];
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].lat, 55.3);
    }

    #[tokio::test]
    async fn authenticate_returns_the_access_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth"))
            .and(body_json(json!({ "key": "key", "secret": "secret" })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "access_token": "tok-123" })),
            )
            .mount(&server)
            .await;

        let client = client(&server.uri(), 30);
        assert_eq!(client.authenticate().await.unwrap(), "tok-123");
    }

    #[tokio::test]
    async fn list_modems_hits_the_company_catalog() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/companies/acme/services"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "modem-1", "provider": "starlink" },
                { "id": "modem-2", "provider": "sonar" },
            ])))
            .mount(&server)
            .await;

        let client = client(&server.uri(), 30);
        let roster = client.list_modems("tok").await.unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[1].provider, "sonar");
    }

    #[test]
    fn epoch_timestamps_are_accepted() {
        let fix = parse_fix(&json!({ "timestamp": 1754042400, "lat": "1.0", "lon": "2.0" }));
        assert!(fix.is_some());
    }
}
