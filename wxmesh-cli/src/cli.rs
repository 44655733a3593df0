use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Parser, Subcommand};
use inquire::{Password, PasswordDisplayMode, Text};
use tokio_util::sync::CancellationToken;
use wxmesh_core::{
    Aggregator, Config, ConsensusReading, NearbyStation, NetatmoCredentials, ProviderError,
    ProviderId,
};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(
    name = "wxmesh",
    version,
    about = "Consensus weather from nearby personal weather stations"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configure credentials for a provider.
    Configure {
        /// Provider short name: "weathercom", "netatmo" or "locationiq".
        provider: String,
    },

    /// Show the averaged current reading.
    Current {
        /// Latitude in decimal degrees; the default location is used unless both are given.
        #[arg(long, allow_hyphen_values = true)]
        lat: Option<f64>,

        /// Longitude in decimal degrees.
        #[arg(long, allow_hyphen_values = true)]
        lon: Option<f64>,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// List stations near a point, nearest first.
    Stations {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        #[arg(long)]
        json: bool,
    },

    /// List registered providers and whether they are configured.
    Sources,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Configure { provider } => configure(&provider),
            Command::Current { lat, lon, json } => {
                let aggregator = Aggregator::from_config(&Config::load()?);
                let cancel = cancel_on_ctrl_c();
                let reading = cancelled_to_anyhow(aggregator.fetch_consensus(lat, lon, &cancel).await)?;
                print_reading(&reading, json)
            }
            Command::Stations { lat, lon, json } => {
                let aggregator = Aggregator::from_config(&Config::load()?);
                let cancel = cancel_on_ctrl_c();
                let stations =
                    cancelled_to_anyhow(aggregator.list_nearby_stations(lat, lon, &cancel).await)?;
                print_stations(&stations, json)
            }
            Command::Sources => {
                let aggregator = Aggregator::from_config(&Config::load()?);
                for provider in aggregator.providers() {
                    let state = if provider.is_usable() {
                        "configured"
                    } else {
                        "not configured"
                    };
                    println!("{:<20} {state}", provider.name());
                }
                Ok(())
            }
        }
    }
}

/// Token that fires on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("interrupt received, cancelling");
            trigger.cancel();
        }
    });
    cancel
}

fn cancelled_to_anyhow<T>(result: Result<T, ProviderError>) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(ProviderError::Cancelled) => bail!("Interrupted"),
        Err(err) => Err(err.into()),
    }
}

fn configure(provider: &str) -> Result<()> {
    let mut config = Config::load()?;

    if provider.eq_ignore_ascii_case("locationiq") {
        let api_key = prompt_secret("LocationIQ API key:")?;
        config.set_locationiq_api_key(api_key);
    } else {
        match ProviderId::try_from(provider)? {
            ProviderId::WeatherCom => {
                let api_key = prompt_secret("Weather.com API key:")?;
                config.set_weathercom_api_key(api_key);
            }
            ProviderId::Netatmo => {
                let client_id = Text::new("Netatmo client id:")
                    .prompt()
                    .context("Failed to read client id")?;
                let client_secret = prompt_secret("Netatmo client secret:")?;
                let refresh_token = prompt_secret("Netatmo refresh token:")?;

                config.set_netatmo_credentials(NetatmoCredentials {
                    client_id: client_id.trim().to_string(),
                    client_secret,
                    refresh_token,
                    access_token: None,
                });
            }
        }
    }

    config.save()?;
    println!("Saved to {}", Config::config_file_path()?.display());
    Ok(())
}

fn prompt_secret(message: &str) -> Result<String> {
    let value = Password::new(message)
        .without_confirmation()
        .with_display_mode(PasswordDisplayMode::Masked)
        .prompt()
        .with_context(|| format!("Failed to read input for '{message}'"))?;

    let value = value.trim().to_string();
    if value.is_empty() {
        bail!("Value must not be empty");
    }
    Ok(value)
}

fn print_reading(reading: &ConsensusReading, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reading)?);
        return Ok(());
    }

    if reading.is_empty() {
        println!("No data available ({})", reading.location_label);
        return Ok(());
    }

    println!("{}", reading.location_label);
    println!("  Temperature: {:.1} °C", reading.temperature_c);
    if let Some(humidity) = reading.humidity_pct {
        println!("  Humidity:    {humidity:.0} %");
    }
    if let Some(pressure) = reading.pressure_mb {
        println!("  Pressure:    {pressure:.1} mb");
    }
    println!("  {}", reading.source_label);
    println!(
        "  Captured at {}",
        reading.captured_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
    );
    Ok(())
}

fn print_stations(stations: &[NearbyStation], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(stations)?);
        return Ok(());
    }

    if stations.is_empty() {
        println!("No stations found");
        return Ok(());
    }

    for station in stations {
        let distance = station
            .distance_km
            .map(|d| format!("{d:.2} km"))
            .unwrap_or_else(|| "?".to_string());
        println!(
            "{:>10}  {:<30} [{}] {}",
            distance, station.display_name, station.source_name, station.id
        );
    }
    Ok(())
}
