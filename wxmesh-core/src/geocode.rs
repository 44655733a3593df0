//! Reverse geocoding: coordinates to a city name, for labelling readings.
//! Uses LocationIQ. Results are cached per ~1 km cell; failures only ever
//! produce `None`.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use std::{collections::HashMap, fmt::Debug, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::{
    model::Coordinates,
    provider::{is_present, send_expecting_success},
};

const DEFAULT_BASE_URL: &str = "https://us1.locationiq.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const CACHE_TTL_HOURS: i64 = 24;

#[async_trait]
pub trait ReverseGeocoder: Send + Sync + Debug {
    /// City name for `at`, or `None` when unknown or unavailable.
    async fn city_name(&self, at: Coordinates, cancel: &CancellationToken) -> Option<String>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    city: Option<String>,
    stored_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct LocationIqGeocoder {
    api_key: String,
    language: String,
    base_url: String,
    timeout: Duration,
    http: Client,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

#[derive(Debug, Deserialize)]
struct ReverseResponse {
    address: Option<Address>,
}

#[derive(Debug, Deserialize)]
struct Address {
    city: Option<String>,
}

impl LocationIqGeocoder {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            language: "en".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            http: Client::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Upper bound for one lookup, independent of the caller's cancellation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn cache_key(at: Coordinates) -> String {
        format!("geocode:{:.2},{:.2}", at.latitude, at.longitude)
    }

    fn cached(&self, key: &str, now: DateTime<Utc>) -> Option<Option<String>> {
        let cache = self.cache.lock();
        let entry = cache.get(key)?;
        is_fresh(entry, now).then(|| entry.city.clone())
    }

    fn store(&self, key: String, city: Option<String>, now: DateTime<Utc>) {
        let mut cache = self.cache.lock();
        cache.retain(|_, entry| is_fresh(entry, now));
        cache.insert(key, CacheEntry { city, stored_at: now });
    }

    async fn lookup(
        &self,
        at: Coordinates,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, crate::ProviderError> {
        let url = format!("{}/v1/reverse", self.base_url);
        let lat = at.latitude.to_string();
        let lon = at.longitude.to_string();

        let request = self.http.get(url).query(&[
            ("lat", lat.as_str()),
            ("lon", lon.as_str()),
            ("format", "json"),
            ("zoom", "10"),
            ("accept-language", self.language.as_str()),
            ("normalizeaddress", "1"),
            ("normalizecity", "1"),
            ("key", self.api_key.as_str()),
        ]);

        let body = send_expecting_success(request, cancel).await?;
        let parsed: ReverseResponse = serde_json::from_str(&body)?;
        Ok(parsed.address.and_then(|a| a.city).filter(|c| is_present(c)))
    }
}

fn is_fresh(entry: &CacheEntry, now: DateTime<Utc>) -> bool {
    now - entry.stored_at < TimeDelta::hours(CACHE_TTL_HOURS)
}

#[async_trait]
impl ReverseGeocoder for LocationIqGeocoder {
    async fn city_name(&self, at: Coordinates, cancel: &CancellationToken) -> Option<String> {
        if !is_present(&self.api_key) {
            return None;
        }

        let key = Self::cache_key(at);
        if let Some(city) = self.cached(&key, Utc::now()) {
            tracing::debug!(%key, ?city, "geocode cache hit");
            return city;
        }

        match tokio::time::timeout(self.timeout, self.lookup(at, cancel)).await {
            Ok(Ok(city)) => {
                // Misses are cached too, so a city-less cell is not asked again.
                self.store(key, city.clone(), Utc::now());
                city
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, lat = at.latitude, lon = at.longitude, "reverse geocoding failed");
                None
            }
            Err(_) => {
                tracing::warn!(lat = at.latitude, lon = at.longitude, "reverse geocoding timed out");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn geocoder(server: &MockServer) -> LocationIqGeocoder {
        LocationIqGeocoder::new("KEY".into()).with_base_url(server.uri())
    }

    #[test]
    fn cache_key_rounds_to_two_decimals() {
        assert_eq!(
            LocationIqGeocoder::cache_key(Coordinates::new(46.3012, 25.2987)),
            "geocode:46.30,25.30"
        );
    }

    #[tokio::test]
    async fn no_api_key_means_no_lookup() {
        let geocoder = LocationIqGeocoder::new(String::new());
        let city = geocoder
            .city_name(Coordinates::new(1.0, 2.0), &CancellationToken::new())
            .await;
        assert_eq!(city, None);
    }

    #[tokio::test]
    async fn results_are_cached_per_cell() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/reverse"))
            .and(query_param("key", "KEY"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "address": { "city": "Odorheiu Secuiesc" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let geocoder = geocoder(&server);
        let cancel = CancellationToken::new();

        let first = geocoder.city_name(Coordinates::new(46.301, 25.301), &cancel).await;
        let second = geocoder.city_name(Coordinates::new(46.304, 25.299), &cancel).await;

        assert_eq!(first.as_deref(), Some("Odorheiu Secuiesc"));
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn misses_are_cached_too() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/reverse"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "address": { "country": "Romania" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let geocoder = geocoder(&server);
        let cancel = CancellationToken::new();
        let at = Coordinates::new(46.0, 25.0);

        assert_eq!(geocoder.city_name(at, &cancel).await, None);
        assert_eq!(geocoder.city_name(at, &cancel).await, None);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/reverse"))
            .respond_with(ResponseTemplate::new(429))
            .expect(2)
            .mount(&server)
            .await;

        let geocoder = geocoder(&server);
        let cancel = CancellationToken::new();
        let at = Coordinates::new(46.0, 25.0);

        assert_eq!(geocoder.city_name(at, &cancel).await, None);
        assert_eq!(geocoder.city_name(at, &cancel).await, None);
    }

    #[tokio::test]
    async fn slow_lookup_times_out_and_is_not_cached() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/reverse"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "address": { "city": "Late" } }))
                    .set_delay(Duration::from_millis(500)),
            )
            .expect(2)
            .mount(&server)
            .await;

        let geocoder = geocoder(&server).with_timeout(Duration::from_millis(50));
        let cancel = CancellationToken::new();
        let at = Coordinates::new(46.0, 25.0);

        assert_eq!(geocoder.city_name(at, &cancel).await, None);
        assert!(geocoder.cache.lock().is_empty());
        assert_eq!(geocoder.city_name(at, &cancel).await, None);
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn stale_entries_are_pruned_on_insert() {
        let geocoder = LocationIqGeocoder::new("KEY".into());
        let now = Utc::now();
        let long_ago = now - TimeDelta::hours(CACHE_TTL_HOURS + 1);

        geocoder.store("geocode:1.00,1.00".into(), Some("Old".into()), long_ago);
        geocoder.store("geocode:2.00,2.00".into(), None, now - TimeDelta::hours(1));
        assert_eq!(geocoder.cached("geocode:1.00,1.00", now), None);

        geocoder.store("geocode:3.00,3.00".into(), Some("New".into()), now);

        let cache = geocoder.cache.lock();
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains_key("geocode:1.00,1.00"));
        assert!(cache.contains_key("geocode:2.00,2.00"));
    }
}
