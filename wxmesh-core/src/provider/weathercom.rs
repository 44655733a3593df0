use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    ProviderError,
    model::{Coordinates, NearbyStation, StationObservation},
    provider::{ProviderId, absorb, is_present, send_expecting_success},
};

use super::WeatherProvider;

const DEFAULT_BASE_URL: &str = "https://api.weather.com";

/// Observations are only requested for this many of the nearest stations.
const MAX_STATIONS: usize = 6;

/// Weather.com personal weather station network, authenticated by a static API key.
#[derive(Debug, Clone)]
pub struct WeatherComProvider {
    api_key: String,
    base_url: String,
    http: Client,
}

impl WeatherComProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
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

    #[tracing::instrument(skip(self, cancel), level = "debug")]
    async fn near_stations(
        &self,
        at: Coordinates,
        cancel: &CancellationToken,
    ) -> Result<Vec<NearbyStation>, ProviderError> {
        let url = format!("{}/v3/location/near", self.base_url);
        let geocode = format!("{},{}", at.latitude, at.longitude);

        let request = self.http.get(url).query(&[
            ("geocode", geocode.as_str()),
            ("product", "pws"),
            ("format", "json"),
            ("apiKey", self.api_key.as_str()),
        ]);

        let body = send_expecting_success(request, cancel).await?;
        parse_near_response(&body, self.name())
    }

    async fn station_observation(
        &self,
        station_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<StationObservation>, ProviderError> {
        let url = format!("{}/v2/pws/observations/current", self.base_url);

        let request = self.http.get(url).query(&[
            ("stationId", station_id),
            ("format", "json"),
            ("units", "m"),
            ("numericPrecision", "decimal"),
            ("apiKey", self.api_key.as_str()),
        ]);

        let body = send_expecting_success(request, cancel).await?;
        parse_observation(&body, station_id, self.name())
    }
}

#[derive(Debug, Deserialize)]
struct NearResponse {
    location: Option<NearLocation>,
}

/// Parallel arrays, one entry per station, aligned by index with `stationId`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NearLocation {
    station_id: Option<Vec<Value>>,
    station_name: Option<Vec<Value>>,
    latitude: Option<Vec<Value>>,
    longitude: Option<Vec<Value>>,
    distance_km: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct PwsResponse {
    observations: Option<Vec<PwsObservation>>,
}

#[derive(Debug, Deserialize)]
struct PwsObservation {
    // Humidity sits on the observation itself, not inside `metric`.
    humidity: Option<Value>,
    metric: Option<PwsMetric>,
}

/// Values are read leniently; one malformed field must not cost the reading.
#[derive(Debug, Deserialize)]
struct PwsMetric {
    temp: Option<Value>,
    pressure: Option<Value>,
}

fn parse_near_response(body: &str, source_name: &str) -> Result<Vec<NearbyStation>, ProviderError> {
    let parsed: NearResponse = serde_json::from_str(body)?;

    let Some(location) = parsed.location else {
        return Ok(Vec::new());
    };

    let ids = location.station_id.unwrap_or_default();
    let names = location.station_name.unwrap_or_default();
    let lats = location.latitude.unwrap_or_default();
    let lons = location.longitude.unwrap_or_default();
    let distances = location.distance_km.unwrap_or_default();

    let stations = ids
        .iter()
        .enumerate()
        .filter_map(|(i, id)| {
            let id = value_as_string(id).filter(|id| is_present(id))?;
            let display_name = names.get(i).and_then(value_as_string).unwrap_or_else(|| id.clone());

            Some(NearbyStation {
                display_name,
                latitude: lats.get(i).and_then(value_as_f64),
                longitude: lons.get(i).and_then(value_as_f64),
                distance_km: distances.get(i).and_then(value_as_f64),
                source_name: source_name.to_string(),
                id,
            })
        })
        .collect();

    Ok(stations)
}

fn parse_observation(
    body: &str,
    station_id: &str,
    source_name: &str,
) -> Result<Option<StationObservation>, ProviderError> {
    // The API answers 204 with an empty body for stations that are offline.
    if body.trim().is_empty() {
        return Ok(None);
    }

    let parsed: PwsResponse = serde_json::from_str(body)?;

    let Some(observation) = parsed.observations.and_then(|obs| obs.into_iter().next()) else {
        return Ok(None);
    };
    let Some(metric) = observation.metric else {
        return Ok(None);
    };
    let Some(temperature_c) = metric.temp.as_ref().and_then(value_as_f64) else {
        return Ok(None);
    };

    Ok(Some(StationObservation {
        station_id: station_id.to_string(),
        temperature_c,
        humidity_pct: observation.humidity.as_ref().and_then(value_as_f64),
        pressure_mb: metric.pressure.as_ref().and_then(value_as_f64),
        source_name: source_name.to_string(),
    }))
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl WeatherProvider for WeatherComProvider {
    fn name(&self) -> &str {
        ProviderId::WeatherCom.display_name()
    }

    fn is_usable(&self) -> bool {
        is_present(&self.api_key)
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

        let stations = absorb(
            self.name(),
            "list nearby stations",
            self.near_stations(at, cancel).await,
        )?;

        let mut observations = Vec::new();
        for station in stations.iter().take(MAX_STATIONS) {
            match self.station_observation(&station.id, cancel).await {
                Ok(Some(obs)) => observations.push(obs),
                Ok(None) => {
                    tracing::debug!(provider = self.name(), station = %station.id, "no temperature reported");
                }
                Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
                Err(err) => {
                    tracing::warn!(
                        provider = self.name(),
                        station = %station.id,
                        error = %err,
                        "failed to fetch station observation"
                    );
                }
            }
        }

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
                provider: ProviderId::WeatherCom.display_name(),
                hint: "set WEATHER_API_KEY or run `wxmesh configure weathercom`",
            });
        }

        absorb(
            self.name(),
            "list nearby stations",
            self.near_stations(at, cancel).await,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const NAME: &str = "Weather.com PWS";

    fn here() -> Coordinates {
        Coordinates::new(46.30, 25.30)
    }

    fn near_body(ids: &[&str]) -> serde_json::Value {
        let distances: Vec<f64> = (0..ids.len()).map(|i| i as f64 * 0.5).collect();
        serde_json::json!({
            "location": {
                "stationId": ids,
                "stationName": ids.iter().map(|id| format!("Station {id}")).collect::<Vec<_>>(),
                "latitude": vec![46.3; ids.len()],
                "longitude": vec![25.3; ids.len()],
                "distanceKm": distances,
            }
        })
    }

    fn obs_body(temp: f64) -> serde_json::Value {
        serde_json::json!({
            "observations": [{ "humidity": 70.0, "metric": { "temp": temp, "pressure": 1012.0 } }]
        })
    }

    #[test]
    fn parses_missing_humidity_as_absent() {
        let body = r#"{"observations":[{"metric":{"temp":15.0,"pressure":1015.0}}]}"#;
        let obs = parse_observation(body, "S1", NAME).unwrap().expect("observation");
        assert_eq!(obs.temperature_c, 15.0);
        assert_eq!(obs.humidity_pct, None);
        assert_eq!(obs.pressure_mb, Some(1015.0));
    }

    #[test]
    fn parses_all_metrics() {
        let body = r#"{"observations":[{"humidity":73.0,"metric":{"temp":2.7,"pressure":1030.82}}]}"#;
        let obs = parse_observation(body, "S1", NAME).unwrap().expect("observation");
        assert_eq!(obs.temperature_c, 2.7);
        assert_eq!(obs.humidity_pct, Some(73.0));
        assert_eq!(obs.pressure_mb, Some(1030.82));
        assert_eq!(obs.source_name, NAME);
    }

    #[test]
    fn missing_or_empty_observations_yield_nothing() {
        assert_eq!(parse_observation("{}", "S1", NAME).unwrap(), None);
        assert_eq!(parse_observation(r#"{"observations":[]}"#, "S1", NAME).unwrap(), None);
        assert_eq!(parse_observation("", "S1", NAME).unwrap(), None);
    }

    #[test]
    fn malformed_humidity_or_pressure_is_dropped_not_the_reading() {
        let body = r#"{"observations":[{"humidity":"n/a","metric":{"temp":15.0,"pressure":1015.0}}]}"#;
        let obs = parse_observation(body, "S1", NAME).unwrap().expect("observation");
        assert_eq!(obs.temperature_c, 15.0);
        assert_eq!(obs.humidity_pct, None);
        assert_eq!(obs.pressure_mb, Some(1015.0));

        let body = r#"{"observations":[{"humidity":"64","metric":{"temp":"9.5","pressure":{"x":1}}}]}"#;
        let obs = parse_observation(body, "S1", NAME).unwrap().expect("observation");
        assert_eq!(obs.temperature_c, 9.5);
        assert_eq!(obs.humidity_pct, Some(64.0));
        assert_eq!(obs.pressure_mb, None);
    }

    #[test]
    fn observation_without_temperature_is_discarded() {
        let no_metric = r#"{"observations":[{"humidity":50}]}"#;
        assert_eq!(parse_observation(no_metric, "S1", NAME).unwrap(), None);

        let no_temp = r#"{"observations":[{"humidity":50,"metric":{"pressure":1000.0}}]}"#;
        assert_eq!(parse_observation(no_temp, "S1", NAME).unwrap(), None);

        let bad_temp = r#"{"observations":[{"humidity":50,"metric":{"temp":"n/a"}}]}"#;
        assert_eq!(parse_observation(bad_temp, "S1", NAME).unwrap(), None);
    }

    #[test]
    fn short_arrays_truncate_fields_to_absent() {
        let body = r#"{
            "location": {
                "stationId": ["A", "B", "C"],
                "stationName": ["Alpha"],
                "latitude": [46.1, 46.2],
                "longitude": [25.1, "25.2"],
                "distanceKm": [0.4]
            }
        }"#;

        let stations = parse_near_response(body, NAME).unwrap();
        assert_eq!(stations.len(), 3);

        assert_eq!(stations[0].display_name, "Alpha");
        assert_eq!(stations[0].distance_km, Some(0.4));

        assert_eq!(stations[1].display_name, "B");
        assert_eq!(stations[1].longitude, Some(25.2));
        assert_eq!(stations[1].distance_km, None);

        assert_eq!(stations[2].latitude, None);
        assert_eq!(stations[2].longitude, None);
    }

    #[test]
    fn blank_station_ids_are_skipped() {
        let body = r#"{"location":{"stationId":["", null, "OK"]}}"#;
        let stations = parse_near_response(body, NAME).unwrap();
        let ids: Vec<_> = stations.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["OK"]);
    }

    #[test]
    fn missing_location_yields_no_stations() {
        assert!(parse_near_response("{}", NAME).unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_nearby_stations_errors_when_not_configured() {
        let provider = WeatherComProvider::new(String::new());
        let err = provider
            .list_nearby_stations(here(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured { .. }));
    }

    #[tokio::test]
    async fn fetch_observations_is_empty_when_not_configured() {
        let provider = WeatherComProvider::new("  ".into());
        let obs = provider
            .fetch_observations(here(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(obs.is_empty());
    }

    #[tokio::test]
    async fn fetches_at_most_six_stations_and_skips_failures() {
        let server = MockServer::start().await;
        let ids = ["S0", "S1", "S2", "S3", "S4", "S5", "S6", "S7"];

        Mock::given(method("GET"))
            .and(path("/v3/location/near"))
            .and(query_param("apiKey", "KEY"))
            .and(query_param("product", "pws"))
            .respond_with(ResponseTemplate::new(200).set_body_json(near_body(&ids)))
            .mount(&server)
            .await;

        for (i, id) in ids.iter().enumerate() {
            let response = match *id {
                "S1" => ResponseTemplate::new(500),
                "S2" => ResponseTemplate::new(200).set_body_string("not json"),
                "S3" => ResponseTemplate::new(204),
                _ => ResponseTemplate::new(200).set_body_json(obs_body(10.0 + i as f64)),
            };
            let expected = if i < MAX_STATIONS { 1 } else { 0 };
            Mock::given(method("GET"))
                .and(path("/v2/pws/observations/current"))
                .and(query_param("stationId", *id))
                .respond_with(response)
                .expect(expected)
                .mount(&server)
                .await;
        }

        let provider = WeatherComProvider::new("KEY".into()).with_base_url(server.uri());
        let obs = provider
            .fetch_observations(here(), &CancellationToken::new())
            .await
            .unwrap();

        let ids: Vec<_> = obs.iter().map(|o| o.station_id.as_str()).collect();
        assert_eq!(ids, ["S0", "S4", "S5"]);
        assert_eq!(obs[1].temperature_c, 14.0);
    }

    #[tokio::test]
    async fn near_lookup_failure_degrades_to_empty() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v3/location/near"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let provider = WeatherComProvider::new("KEY".into()).with_base_url(server.uri());
        let cancel = CancellationToken::new();

        assert!(provider.fetch_observations(here(), &cancel).await.unwrap().is_empty());
        assert!(provider.list_nearby_stations(here(), &cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_propagates() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v3/location/near"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(near_body(&["S0"]))
                    .set_delay(std::time::Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let provider = WeatherComProvider::new("KEY".into()).with_base_url(server.uri());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = provider.fetch_observations(here(), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
