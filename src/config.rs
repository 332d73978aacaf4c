use std::env;
use std::time::Duration;

use crate::engine::dispatcher::TrackingSettings;
use crate::engine::reporter::ThrottleConfig;
use crate::engine::route_cache::RouteCacheConfig;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub event_buffer_size: usize,
    pub audit_buffer_size: usize,
    pub audit_retain: usize,
    pub store_max_attempts: u32,
    pub sample_channel_size: usize,
    pub throttle_min_distance_m: f64,
    pub throttle_min_interval_ms: u64,
    pub sample_interval_ms: u64,
    pub max_delivery_delay_ms: u64,
    pub route_min_distance_m: f64,
    pub route_max_age_ms: u64,
    pub route_timeout_ms: u64,
    pub route_service_url: String,
    pub session_reap_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            event_buffer_size: 1024,
            audit_buffer_size: 1024,
            audit_retain: 500,
            store_max_attempts: 5,
            sample_channel_size: 64,
            throttle_min_distance_m: 15.0,
            throttle_min_interval_ms: 12_000,
            sample_interval_ms: 12_000,
            max_delivery_delay_ms: 10_000,
            route_min_distance_m: 30.0,
            route_max_age_ms: 15_000,
            route_timeout_ms: 10_000,
            route_service_url: "https://router.project-osrm.org".to_string(),
            session_reap_interval_ms: 30_000,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let log_format = match env::var("LOG_FORMAT") {
            Ok(raw) if raw.eq_ignore_ascii_case("json") => LogFormat::Json,
            Ok(raw) if raw.eq_ignore_ascii_case("compact") => LogFormat::Compact,
            Ok(raw) => {
                return Err(AppError::InvalidArgument(format!(
                    "invalid LOG_FORMAT: {raw}, expected compact or json"
                )));
            }
            Err(_) => defaults.log_format,
        };

        let config = Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", defaults.event_buffer_size)?,
            audit_buffer_size: parse_or_default("AUDIT_BUFFER_SIZE", defaults.audit_buffer_size)?,
            audit_retain: parse_or_default("AUDIT_RETAIN", defaults.audit_retain)?,
            store_max_attempts: parse_or_default("STORE_MAX_ATTEMPTS", defaults.store_max_attempts)?,
            sample_channel_size: parse_or_default(
                "SAMPLE_CHANNEL_SIZE",
                defaults.sample_channel_size,
            )?,
            throttle_min_distance_m: parse_or_default(
                "THROTTLE_MIN_DISTANCE_M",
                defaults.throttle_min_distance_m,
            )?,
            throttle_min_interval_ms: parse_or_default(
                "THROTTLE_MIN_INTERVAL_MS",
                defaults.throttle_min_interval_ms,
            )?,
            sample_interval_ms: parse_or_default("SAMPLE_INTERVAL_MS", defaults.sample_interval_ms)?,
            max_delivery_delay_ms: parse_or_default(
                "MAX_DELIVERY_DELAY_MS",
                defaults.max_delivery_delay_ms,
            )?,
            route_min_distance_m: parse_or_default(
                "ROUTE_MIN_DISTANCE_M",
                defaults.route_min_distance_m,
            )?,
            route_max_age_ms: parse_or_default("ROUTE_MAX_AGE_MS", defaults.route_max_age_ms)?,
            route_timeout_ms: parse_or_default("ROUTE_TIMEOUT_MS", defaults.route_timeout_ms)?,
            route_service_url: env::var("ROUTE_SERVICE_URL").unwrap_or(defaults.route_service_url),
            session_reap_interval_ms: parse_or_default(
                "SESSION_REAP_INTERVAL_MS",
                defaults.session_reap_interval_ms,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !(self.throttle_min_distance_m >= 0.0 && self.route_min_distance_m >= 0.0) {
            return Err(AppError::InvalidArgument(
                "distance thresholds must be non-negative".to_string(),
            ));
        }
        if self.route_timeout_ms == 0 {
            return Err(AppError::InvalidArgument(
                "ROUTE_TIMEOUT_MS must be > 0".to_string(),
            ));
        }
        if self.session_reap_interval_ms == 0 {
            return Err(AppError::InvalidArgument(
                "SESSION_REAP_INTERVAL_MS must be > 0".to_string(),
            ));
        }
        if self.store_max_attempts == 0 {
            return Err(AppError::InvalidArgument(
                "STORE_MAX_ATTEMPTS must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn route_timeout(&self) -> Duration {
        Duration::from_millis(self.route_timeout_ms)
    }

    pub fn session_reap_interval(&self) -> Duration {
        Duration::from_millis(self.session_reap_interval_ms)
    }

    pub fn tracking_settings(&self) -> TrackingSettings {
        TrackingSettings {
            throttle: ThrottleConfig {
                min_distance_m: self.throttle_min_distance_m,
                min_interval: Duration::from_millis(self.throttle_min_interval_ms),
                sample_interval: Duration::from_millis(self.sample_interval_ms),
                max_delivery_delay: Duration::from_millis(self.max_delivery_delay_ms),
            },
            route: RouteCacheConfig {
                min_distance_m: self.route_min_distance_m,
                max_age: Duration::from_millis(self.route_max_age_ms),
                query_timeout: self.route_timeout(),
            },
            sample_channel_size: self.sample_channel_size,
        }
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::InvalidArgument(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
