//! Fan-out across every usable provider and merge what comes back.

use std::{future::Future, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::{
    Config, ProviderError,
    geo,
    geocode::{LocationIqGeocoder, ReverseGeocoder},
    model::{
        ConsensusReading, Coordinates, DefaultLocation, NearbyStation, SourceContribution,
        StationObservation,
    },
    provider::{WeatherProvider, is_present, providers_from_config},
};

#[derive(Debug, Clone)]
pub struct Aggregator {
    providers: Vec<Arc<dyn WeatherProvider>>,
    default_location: DefaultLocation,
    geocoder: Option<Arc<dyn ReverseGeocoder>>,
}

impl Aggregator {
    pub fn new(providers: Vec<Arc<dyn WeatherProvider>>) -> Self {
        Self {
            providers,
            default_location: DefaultLocation::default(),
            geocoder: None,
        }
    }

    /// Every known provider, the configured default location and, when a
    /// LocationIQ key is present, reverse geocoding.
    pub fn from_config(config: &Config) -> Self {
        let mut aggregator =
            Self::new(providers_from_config(config)).with_default_location(config.default_location());

        if let Some(key) = config.providers.locationiq_api_key().filter(|k| is_present(k)) {
            aggregator = aggregator.with_geocoder(Arc::new(LocationIqGeocoder::new(key.to_owned())));
        }

        aggregator
    }

    pub fn with_default_location(mut self, default_location: DefaultLocation) -> Self {
        self.default_location = default_location;
        self
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn ReverseGeocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn providers(&self) -> &[Arc<dyn WeatherProvider>] {
        &self.providers
    }

    fn usable_providers(&self) -> Vec<Arc<dyn WeatherProvider>> {
        self.providers.iter().filter(|p| p.is_usable()).cloned().collect()
    }

    /// Consensus reading near the given point, or near the default location
    /// when either coordinate is missing.
    ///
    /// Never fails because a provider did; an empty reading means no data.
    /// Fails only when `cancel` fires.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn fetch_consensus(
        &self,
        latitude: Option<f64>,
        longitude: Option<f64>,
        cancel: &CancellationToken,
    ) -> Result<ConsensusReading, ProviderError> {
        let at = match (latitude, longitude) {
            (Some(lat), Some(lon)) => Coordinates::new(lat, lon),
            _ => self.default_location.coordinates(),
        };
        let is_default = geo::same_point(at, self.default_location.coordinates());

        let usable = self.usable_providers();
        if usable.is_empty() {
            tracing::warn!("no weather providers are configured");
            return Ok(ConsensusReading::empty(self.plain_location_label(at, is_default)));
        }

        tracing::debug!(
            count = usable.len(),
            providers = %names(&usable),
            "fetching observations"
        );

        let results = fan_out(usable, cancel, "fetch observations", move |provider, cancel| async move {
            provider.fetch_observations(at, &cancel).await
        })
        .await?;

        let mut observations = Vec::new();
        let mut contributions = Vec::new();
        for (source_name, items) in results {
            if items.is_empty() {
                continue;
            }
            tracing::debug!(provider = %source_name, count = items.len(), "got observations");
            contributions.push(SourceContribution {
                source_name,
                count: items.len(),
            });
            observations.extend(items);
        }

        if observations.is_empty() {
            tracing::warn!("no observations received from any provider");
            return Ok(ConsensusReading::empty(self.plain_location_label(at, is_default)));
        }

        let location_label = self.location_label(at, is_default, cancel).await;
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let headline = if is_default {
            self.default_location.name.as_str()
        } else {
            "Nearby mean"
        };

        Ok(build_consensus(&observations, contributions, location_label, headline))
    }

    /// Stations from every usable provider, nearest first. Stations without
    /// a distance come last, in arrival order.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn list_nearby_stations(
        &self,
        latitude: f64,
        longitude: f64,
        cancel: &CancellationToken,
    ) -> Result<Vec<NearbyStation>, ProviderError> {
        let at = Coordinates::new(latitude, longitude);
        let usable = self.usable_providers();

        let results = fan_out(usable, cancel, "list nearby stations", move |provider, cancel| async move {
            provider.list_nearby_stations(at, &cancel).await
        })
        .await?;

        let mut stations: Vec<NearbyStation> =
            results.into_iter().flat_map(|(_, items)| items).collect();
        geo::sort_by_distance(&mut stations);

        Ok(stations)
    }

    fn plain_location_label(&self, at: Coordinates, is_default: bool) -> String {
        if is_default {
            self.default_location.name.clone()
        } else {
            format!("{:.4},{:.4}", at.latitude, at.longitude)
        }
    }

    async fn location_label(&self, at: Coordinates, is_default: bool, cancel: &CancellationToken) -> String {
        if is_default {
            return self.default_location.name.clone();
        }

        match &self.geocoder {
            Some(geocoder) => match geocoder.city_name(at, cancel).await {
                Some(city) => city,
                None => self.plain_location_label(at, false),
            },
            None => self.plain_location_label(at, false),
        }
    }
}

/// Run `call` once per provider as its own task and wait for all of them.
///
/// A task that fails or panics contributes an empty list; siblings are
/// unaffected. Results keep provider order. Only cancellation is returned.
async fn fan_out<T, F, Fut>(
    providers: Vec<Arc<dyn WeatherProvider>>,
    cancel: &CancellationToken,
    what: &'static str,
    call: F,
) -> Result<Vec<(String, Vec<T>)>, ProviderError>
where
    T: Send + 'static,
    F: Fn(Arc<dyn WeatherProvider>, CancellationToken) -> Fut,
    Fut: Future<Output = Result<Vec<T>, ProviderError>> + Send + 'static,
{
    let tasks: Vec<_> = providers
        .into_iter()
        .map(|provider| {
            let name = provider.name().to_string();
            let handle = tokio::spawn(call(provider, cancel.clone()));
            (name, handle)
        })
        .collect();

    let mut cancelled = false;
    let mut results = Vec::with_capacity(tasks.len());

    for (name, handle) in tasks {
        let items = match handle.await {
            Ok(Ok(items)) => items,
            Ok(Err(ProviderError::Cancelled)) => {
                cancelled = true;
                Vec::new()
            }
            Ok(Err(err)) => {
                tracing::warn!(provider = %name, error = %err, "failed to {what}");
                Vec::new()
            }
            Err(err) => {
                tracing::error!(provider = %name, error = %err, "{what} task did not complete");
                Vec::new()
            }
        };
        results.push((name, items));
    }

    if cancelled || cancel.is_cancelled() {
        return Err(ProviderError::Cancelled);
    }

    Ok(results)
}

fn build_consensus(
    observations: &[StationObservation],
    contributions: Vec<SourceContribution>,
    location_label: String,
    headline: &str,
) -> ConsensusReading {
    let temperature = mean(observations.iter().map(|o| o.temperature_c));
    let humidity = mean(observations.iter().filter_map(|o| o.humidity_pct));
    let pressure = mean(observations.iter().filter_map(|o| o.pressure_mb));

    let details = contributions
        .iter()
        .map(|c| format!("{} {}", c.count, c.source_name))
        .collect::<Vec<_>>()
        .join(", ");

    ConsensusReading {
        temperature_c: temperature.map(|t| round_to(t, 1)).unwrap_or_default(),
        humidity_pct: humidity.map(|h| round_to(h, 0)),
        pressure_mb: pressure.map(|p| round_to(p, 1)),
        source_label: format!(
            "{headline} (Mean of {} stations: {details})",
            observations.len()
        ),
        location_label,
        station_count: observations.len(),
        contributions,
        captured_at: chrono::Utc::now(),
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Round half to even, matching how the readings have always been presented.
fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round_ties_even() / factor
}

fn names(providers: &[Arc<dyn WeatherProvider>]) -> String {
    providers.iter().map(|p| p.name()).collect::<Vec<_>>().join(", ")
}
