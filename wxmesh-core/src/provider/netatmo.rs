//! Netatmo public weather stations, accessed through OAuth2.
//!
//! The provider holds a short-lived access token that it refreshes on demand
//! using the configured refresh token. A refresh that fails leaves the
//! previous state in place and the request that needed it yields nothing.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    ProviderError,
    config::NetatmoCredentials,
    geo::{self, BoundingBox},
    model::{Coordinates, NearbyStation, StationObservation},
    provider::{ProviderId, absorb, is_present, send_expecting_success},
};

use super::WeatherProvider;

const DEFAULT_BASE_URL: &str = "https://api.netatmo.com";

/// Roughly 5 km at mid-latitudes.
const BOUNDING_BOX_HALF_WIDTH_DEG: f64 = 0.05;

const REFRESH_MARGIN_MINUTES: i64 = 5;
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3 * 60 * 60;

/// Where the access token stands relative to a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    NoToken,
    Valid,
    ExpiringSoon,
    /// Expired, or held without a known expiry.
    Invalid,
}

#[derive(Debug, Clone, Default)]
struct TokenState {
    access_token: Option<String>,
    refresh_token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl TokenState {
    fn status_at(&self, now: DateTime<Utc>) -> TokenStatus {
        if self.access_token.as_deref().is_none_or(|t| !is_present(t)) {
            return TokenStatus::NoToken;
        }

        match self.expires_at {
            None => TokenStatus::Invalid,
            Some(expires_at) if expires_at <= now => TokenStatus::Invalid,
            Some(expires_at) if expires_at - now <= TimeDelta::minutes(REFRESH_MARGIN_MINUTES) => {
                TokenStatus::ExpiringSoon
            }
            Some(_) => TokenStatus::Valid,
        }
    }

    fn valid_token_at(&self, now: DateTime<Utc>) -> Option<String> {
        match self.status_at(now) {
            TokenStatus::Valid => self.access_token.clone(),
            _ => None,
        }
    }

    /// Adopt a successful refresh response. Leaves the state untouched on error.
    fn apply_refresh(
        &mut self,
        response: TokenResponse,
        now: DateTime<Utc>,
    ) -> Result<String, ProviderError> {
        let access_token = response
            .access_token
            .filter(|t| is_present(t))
            .ok_or_else(|| ProviderError::TokenRefresh("response carried no access_token".into()))?;

        // Rotated refresh tokens are only kept in memory.
        if let Some(refresh_token) = response.refresh_token.filter(|t| is_present(t)) {
            tracing::debug!(provider = ProviderId::Netatmo.display_name(), "refresh token rotated");
            self.refresh_token = refresh_token;
        }

        let lifetime = response
            .expires_in
            .as_ref()
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|secs| secs.trunc() as i64)))
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);

        self.expires_at = Some(now + TimeDelta::seconds(lifetime));
        self.access_token = Some(access_token.clone());

        Ok(access_token)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<Value>,
}

pub struct NetatmoProvider {
    client_id: String,
    client_secret: String,
    state: Mutex<TokenState>,
    // Single-flight guard around the check-then-refresh sequence.
    refresh_lock: tokio::sync::Mutex<()>,
    base_url: String,
    http: Client,
}

impl std::fmt::Debug for NetatmoProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetatmoProvider")
            .field("client_id", &self.client_id)
            .field("base_url", &self.base_url)
            .field("token_status", &self.token_status())
            .finish_non_exhaustive()
    }
}

impl NetatmoProvider {
    pub fn new(credentials: NetatmoCredentials) -> Self {
        let state = TokenState {
            access_token: credentials.access_token.filter(|t| is_present(t)),
            refresh_token: credentials.refresh_token,
            expires_at: None,
        };

        Self {
            client_id: credentials.client_id,
            client_secret: credentials.client_secret,
            state: Mutex::new(state),
            refresh_lock: tokio::sync::Mutex::new(()),
            base_url: DEFAULT_BASE_URL.to_string(),
            http: Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    pub fn token_status(&self) -> TokenStatus {
        self.state.lock().status_at(Utc::now())
    }

    /// Return a valid access token, refreshing first if needed.
    ///
    /// `Ok(None)` means no usable token could be obtained.
    async fn ensure_access_token(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ProviderError> {
        let cached = self.state.lock().valid_token_at(Utc::now());
        if let Some(token) = cached {
            return Ok(Some(token));
        }

        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            guard = self.refresh_lock.lock() => guard,
        };

        // Another request may have refreshed while we were waiting.
        let cached = self.state.lock().valid_token_at(Utc::now());
        if let Some(token) = cached {
            return Ok(Some(token));
        }

        match self.refresh_access_token(cancel).await {
            Ok(token) => Ok(Some(token)),
            Err(ProviderError::Cancelled) => Err(ProviderError::Cancelled),
            Err(err) => {
                tracing::error!(provider = self.name(), error = %err, "token refresh failed");
                Ok(None)
            }
        }
    }

    #[tracing::instrument(skip(self, cancel), level = "debug")]
    async fn refresh_access_token(&self, cancel: &CancellationToken) -> Result<String, ProviderError> {
        let refresh_token = self.state.lock().refresh_token.clone();
        if !is_present(&refresh_token) || !is_present(&self.client_id) || !is_present(&self.client_secret) {
            return Err(ProviderError::TokenRefresh("missing credentials".into()));
        }

        let url = format!("{}/oauth2/token", self.base_url);
        let request = self.http.post(url).form(&[
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token.as_str()),
        ]);

        let body = send_expecting_success(request, cancel).await?;
        let response: TokenResponse = serde_json::from_str(&body)?;

        let mut state = self.state.lock();
        let token = state.apply_refresh(response, Utc::now())?;
        tracing::debug!(provider = self.name(), expires_at = ?state.expires_at, "access token refreshed");

        Ok(token)
    }

    /// Raw `getpublicdata` body for the box around `at`, or `None` without a token.
    async fn public_data(
        &self,
        at: Coordinates,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ProviderError> {
        let Some(token) = self.ensure_access_token(cancel).await? else {
            tracing::warn!(provider = self.name(), "no valid access token available");
            return Ok(None);
        };

        let bbox = BoundingBox::around(at, BOUNDING_BOX_HALF_WIDTH_DEG);
        let url = format!("{}/api/getpublicdata", self.base_url);
        let request = self.http.post(url).bearer_auth(token).form(&[
            ("lat_ne", bbox.lat_ne.to_string()),
            ("lon_ne", bbox.lon_ne.to_string()),
            ("lat_sw", bbox.lat_sw.to_string()),
            ("lon_sw", bbox.lon_sw.to_string()),
            ("filter", "true".to_string()),
        ]);

        send_expecting_success(request, cancel).await.map(Some)
    }

    async fn try_fetch_observations(
        &self,
        at: Coordinates,
        cancel: &CancellationToken,
    ) -> Result<Vec<StationObservation>, ProviderError> {
        match self.public_data(at, cancel).await? {
            Some(body) => parse_observations(&body, self.name()),
            None => Ok(Vec::new()),
        }
    }

    async fn try_list_stations(
        &self,
        at: Coordinates,
        cancel: &CancellationToken,
    ) -> Result<Vec<NearbyStation>, ProviderError> {
        match self.public_data(at, cancel).await? {
            Some(body) => parse_stations(&body, at, self.name()),
            None => Ok(Vec::new()),
        }
    }

    #[cfg(test)]
    fn with_token(self, access_token: &str, expires_at: DateTime<Utc>) -> Self {
        {
            let mut state = self.state.lock();
            state.access_token = Some(access_token.to_string());
            state.expires_at = Some(expires_at);
        }
        self
    }
}

#[derive(Debug, Deserialize)]
struct PublicDataResponse {
    // Decoded device by device so one malformed entry cannot sink the batch.
    body: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct Device {
    #[serde(rename = "_id")]
    id: Option<String>,
    place: Option<Place>,
    measures: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct Place {
    /// `[longitude, latitude]`
    location: Option<Vec<Value>>,
}

/// One module's measurements: `type` names line up with each batch in `res`.
#[derive(Debug, Deserialize)]
struct Module {
    #[serde(rename = "type")]
    types: Option<Vec<Value>>,
    res: Option<Map<String, Value>>,
}

impl Device {
    fn usable_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| is_present(id))
    }

    fn location(&self) -> Option<Coordinates> {
        let location = self.place.as_ref()?.location.as_ref()?;
        let lon = location.first()?.as_f64()?;
        let lat = location.get(1)?.as_f64()?;
        Some(Coordinates::new(lat, lon))
    }

    fn observation(&self, source_name: &str) -> Option<StationObservation> {
        let station_id = self.usable_id()?;

        let mut temperature = None;
        let mut humidity = None;
        let mut pressure = None;

        let modules = self
            .measures
            .iter()
            .flat_map(|m| m.values())
            .filter_map(|v| Module::deserialize(v).ok());

        for module in modules {
            let (Some(types), Some(res)) = (module.types, module.res) else {
                continue;
            };
            // Only the first (most recent) batch counts.
            let Some(values) = res.values().next().and_then(Value::as_array) else {
                continue;
            };

            for (kind, value) in types.iter().zip(values) {
                let (Some(kind), Some(value)) = (kind.as_str(), value.as_f64()) else {
                    continue;
                };
                match kind.to_ascii_lowercase().as_str() {
                    "temperature" => temperature = Some(value),
                    "humidity" => humidity = Some(value),
                    "pressure" => pressure = Some(value),
                    _ => {}
                }
            }
        }

        Some(StationObservation {
            station_id: station_id.to_string(),
            temperature_c: temperature?,
            humidity_pct: humidity,
            pressure_mb: pressure,
            source_name: source_name.to_string(),
        })
    }
}

fn parse_devices(body: &str) -> Result<Vec<Device>, ProviderError> {
    let parsed: PublicDataResponse = serde_json::from_str(body)?;
    let devices = parsed
        .body
        .unwrap_or_default()
        .iter()
        .filter_map(|v| match Device::deserialize(v) {
            Ok(device) => Some(device),
            Err(err) => {
                tracing::debug!(error = %err, "skipping malformed device");
                None
            }
        })
        .collect();
    Ok(devices)
}

fn parse_observations(body: &str, source_name: &str) -> Result<Vec<StationObservation>, ProviderError> {
    let observations = parse_devices(body)?
        .iter()
        .filter_map(|device| device.observation(source_name))
        .collect();
    Ok(observations)
}

fn parse_stations(
    body: &str,
    origin: Coordinates,
    source_name: &str,
) -> Result<Vec<NearbyStation>, ProviderError> {
    let mut stations: Vec<NearbyStation> = parse_devices(body)?
        .iter()
        .filter_map(|device| {
            let id = device.usable_id()?;
            let location = device.location();

            Some(NearbyStation {
                id: id.to_string(),
                display_name: format!("Netatmo {}", id_suffix(id)),
                latitude: location.map(|c| c.latitude),
                longitude: location.map(|c| c.longitude),
                distance_km: location.map(|c| geo::haversine_km(origin, c)),
                source_name: source_name.to_string(),
            })
        })
        .collect();

    geo::sort_by_distance(&mut stations);
    Ok(stations)
}

/// Last four characters of a device id (the whole id if shorter).
fn id_suffix(id: &str) -> &str {
    let start = id.char_indices().rev().nth(3).map(|(i, _)| i).unwrap_or(0);
    &id[start..]
}

#[async_trait]
impl WeatherProvider for NetatmoProvider {
    fn name(&self) -> &str {
        ProviderId::Netatmo.display_name()
    }

    fn is_usable(&self) -> bool {
        is_present(&self.client_id)
            && is_present(&self.client_secret)
            && is_present(&self.state.lock().refresh_token)
    }

    async fn fetch_observations(
        &self,
        at: Coordinates,
        cancel: &CancellationToken,
    ) -> Result<Vec<StationObservation>, ProviderError> {
        if !self.is_usable() {
            tracing::debug!(provider = self.name(), "not configured, skipping");
            return Ok(Vec::new());
        }

        let observations = absorb(
            self.name(),
            "fetch observations",
            self.try_fetch_observations(at, cancel).await,
        )?;

        tracing::debug!(provider = self.name(), count = observations.len(), "fetched observations");
        Ok(observations)
    }

    async fn list_nearby_stations(
        &self,
        at: Coordinates,
        cancel: &CancellationToken,
    ) -> Result<Vec<NearbyStation>, ProviderError> {
        if !self.is_usable() {
            return Err(ProviderError::NotConfigured {
                provider: ProviderId::Netatmo.display_name(),
                hint: "set NETATMO_CLIENT_ID, NETATMO_CLIENT_SECRET and NETATMO_REFRESH_TOKEN \
                       or run `wxmesh configure netatmo`",
            });
        }

        absorb(
            self.name(),
            "list nearby stations",
            self.try_list_stations(at, cancel).await,
        )
    }
}
