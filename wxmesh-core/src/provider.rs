use crate::{
    Config, ProviderError,
    model::{Coordinates, NearbyStation, StationObservation},
    provider::{netatmo::NetatmoProvider, weathercom::WeatherComProvider},
};
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use std::{convert::TryFrom, fmt::Debug, sync::Arc};
use tokio_util::sync::CancellationToken;

pub mod netatmo;
pub mod weathercom;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderId {
    WeatherCom,
    Netatmo,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::WeatherCom => "weathercom",
            ProviderId::Netatmo => "netatmo",
        }
    }

    /// Human-readable name used in consensus labels and logs.
    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderId::WeatherCom => "Weather.com PWS",
            ProviderId::Netatmo => "Netatmo",
        }
    }

    /// Registration order; consensus labels list contributions in this order.
    pub const fn all() -> &'static [ProviderId] {
        &[ProviderId::WeatherCom, ProviderId::Netatmo]
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ProviderId {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let lower = value.to_lowercase();

        match lower.as_str() {
            "weathercom" => Ok(ProviderId::WeatherCom),
            "netatmo" => Ok(ProviderId::Netatmo),
            _ => Err(anyhow::anyhow!(
                "Unknown provider '{value}'. Supported providers: weathercom, netatmo."
            )),
        }
    }
}

/// Capability contract shared by every station network.
#[async_trait]
pub trait WeatherProvider: Send + Sync + Debug {
    /// Stable, non-empty identifier used in labels and logs.
    fn name(&self) -> &str;

    /// Whether the required credentials are present right now.
    fn is_usable(&self) -> bool;

    /// Best-effort observations near `at`.
    ///
    /// Expected failures (missing credentials, bad status, malformed
    /// payload) degrade to an empty list. Only cancellation is returned as
    /// an error.
    async fn fetch_observations(
        &self,
        at: Coordinates,
        cancel: &CancellationToken,
    ) -> Result<Vec<StationObservation>, ProviderError>;

    /// Stations near `at`.
    ///
    /// Same tolerance as [`WeatherProvider::fetch_observations`], except
    /// that an unusable provider reports [`ProviderError::NotConfigured`].
    async fn list_nearby_stations(
        &self,
        at: Coordinates,
        cancel: &CancellationToken,
    ) -> Result<Vec<NearbyStation>, ProviderError>;
}

/// Build every known provider from config, in registration order.
///
/// Providers are registered whether or not they are configured; usability
/// is checked per call.
pub fn providers_from_config(config: &Config) -> Vec<Arc<dyn WeatherProvider>> {
    ProviderId::all()
        .iter()
        .map(|id| provider_from_config(*id, config))
        .collect()
}

/// Construct a single provider from config and explicit ProviderId.
pub fn provider_from_config(id: ProviderId, config: &Config) -> Arc<dyn WeatherProvider> {
    match id {
        ProviderId::WeatherCom => {
            let api_key = config.providers.weathercom_api_key().unwrap_or_default();
            Arc::new(WeatherComProvider::new(api_key.to_owned()))
        }
        ProviderId::Netatmo => {
            let creds = config.providers.netatmo.clone().unwrap_or_default();
            Arc::new(NetatmoProvider::new(creds))
        }
    }
}

pub(crate) fn is_present(value: &str) -> bool {
    !value.trim().is_empty()
}

/// Send a request and read its body, aborting as soon as `cancel` fires.
pub(crate) async fn send_cancellable(
    request: RequestBuilder,
    cancel: &CancellationToken,
) -> Result<(StatusCode, String), ProviderError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        res = async {
            let res = request.send().await?;
            let status = res.status();
            let body = res.text().await?;
            Ok::<_, ProviderError>((status, body))
        } => res,
    }
}

/// Like [`send_cancellable`], but turns a non-success status into an error.
pub(crate) async fn send_expecting_success(
    request: RequestBuilder,
    cancel: &CancellationToken,
) -> Result<String, ProviderError> {
    let (status, body) = send_cancellable(request, cancel).await?;
    if !status.is_success() {
        return Err(ProviderError::status(status, &body));
    }
    Ok(body)
}

/// Degrade any failure except cancellation to the empty value.
pub(crate) fn absorb<T: Default>(
    provider: &str,
    what: &str,
    result: Result<T, ProviderError>,
) -> Result<T, ProviderError> {
    match result {
        Ok(value) => Ok(value),
        Err(ProviderError::Cancelled) => Err(ProviderError::Cancelled),
        Err(err) => {
            tracing::warn!(provider, error = %err, "failed to {what}");
            Ok(T::default())
        }
    }
}
