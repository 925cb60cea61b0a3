use event_bus::relay::{DestinationMap, RelayConfig};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusType {
    Nats,
    InMemory,
}

impl BusType {
    /// The relay only marks entries processed once a broker accepted them, so
    /// the bus must be chosen explicitly
    fn parse(value: Option<String>) -> Result<Self, String> {
        let value = value.ok_or_else(|| "BUS_TYPE must be set to 'nats' or 'inmemory'".to_string())?;
        match value.trim().to_lowercase().as_str() {
            "nats" => Ok(BusType::Nats),
            "inmemory" => Ok(BusType::InMemory),
            other => Err(format!(
                "BUS_TYPE has an invalid value '{}', expected 'nats' or 'inmemory'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: BusType,
    pub database_url: String,
    pub nats_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub relay: RelayConfig,
    /// Record entries that stall in `dead_letter_records`
    pub dead_letter_stalled: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bus_type = BusType::parse(lookup("BUS_TYPE"))?;
        let database_url =
            lookup("DATABASE_URL").ok_or_else(|| "DATABASE_URL must be set".to_string())?;

        let nats_url = match bus_type {
            BusType::Nats => {
                Some(lookup("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string()))
            }
            BusType::InMemory => None,
        };

        let defaults = RelayConfig::default();

        let default_destination = lookup("RELAY_DEFAULT_DESTINATION")
            .unwrap_or_else(|| defaults.destinations.default_destination().to_string());
        let destinations = DestinationMap::parse(
            &lookup("RELAY_DESTINATIONS").unwrap_or_default(),
            default_destination,
        )
        .map_err(|e| format!("RELAY_DESTINATIONS: {}", e))?;

        let batch_size: i64 = parse_or(&lookup, "RELAY_BATCH_SIZE", defaults.batch_size)?;
        if batch_size <= 0 {
            return Err("RELAY_BATCH_SIZE must be positive".to_string());
        }
        let max_retries: i32 = parse_or(&lookup, "RELAY_MAX_RETRIES", defaults.max_retries)?;
        if max_retries <= 0 {
            return Err("RELAY_MAX_RETRIES must be positive".to_string());
        }

        let purge_after = match lookup("RELAY_PURGE_AFTER_HOURS") {
            Some(hours) => {
                let hours: u64 = hours
                    .trim()
                    .parse()
                    .map_err(|_| format!("RELAY_PURGE_AFTER_HOURS has an invalid value '{}'", hours))?;
                Some(Duration::from_secs(hours * 3600))
            }
            None => None,
        };

        let relay = RelayConfig {
            batch_size,
            poll_interval: Duration::from_millis(parse_or(&lookup, "RELAY_POLL_INTERVAL_MS", 100)?),
            max_retries,
            publish_timeout: Duration::from_millis(parse_or(
                &lookup,
                "RELAY_PUBLISH_TIMEOUT_MS",
                5000,
            )?),
            destinations,
            purge_after,
            maintenance_interval: defaults.maintenance_interval,
        };

        Ok(Self {
            bus_type,
            database_url,
            nats_url,
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&lookup, "PORT", 8099)?,
            relay,
            dead_letter_stalled: parse_or(&lookup, "RELAY_DEAD_LETTER_STALLED", false)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T, String>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| format!("{} has an invalid value '{}'", name, value)),
        None => Ok(default),
    }
}
