//! Core library for the `wxmesh` CLI.
//!
//! This crate defines:
//! - Configuration & credentials handling
//! - Weather station providers behind one async trait
//! - The aggregator that fans out across providers and averages the result
//! - Shared domain models and geographic helpers
//!
//! It is used by `wxmesh-cli`, but can also be reused by other binaries or services.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod geo;
pub mod geocode;
pub mod model;
pub mod provider;

pub use aggregator::Aggregator;
pub use config::{ApiKeyConfig, Config, NetatmoCredentials, ProvidersConfig};
pub use error::ProviderError;
pub use geocode::{LocationIqGeocoder, ReverseGeocoder};
pub use model::{
    ConsensusReading, Coordinates, DefaultLocation, NearbyStation, SourceContribution,
    StationObservation,
};
pub use provider::{ProviderId, WeatherProvider};
