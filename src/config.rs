use std::env;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::error::AppError;

#[derive(Debug, Clone, PartialEq, Eq)]
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
    pub commission_rate: Decimal,
    pub request_ttl: Duration,
    pub staleness_threshold: Duration,
    pub max_clock_skew: Duration,
    pub session_retention: Duration,
    pub auto_confirm_after: Duration,
    pub search_radius_km: f64,
    pub radius_growth_factor: f64,
    pub max_search_attempts: u32,
    pub eta_cadence: Duration,
    pub eta_min_displacement_m: f64,
    pub fallback_speed_kmh: f64,
    pub routing_timeout: Duration,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Copy)]
pub struct RetrySettings {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub max_times: usize,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(1_000),
            max_times: 4,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            event_buffer_size: 1024,
            commission_rate: Decimal::new(135, 3),
            request_ttl: Duration::from_secs(30),
            staleness_threshold: Duration::from_secs(120),
            max_clock_skew: Duration::from_secs(30),
            session_retention: Duration::from_secs(15 * 60),
            auto_confirm_after: Duration::from_secs(24 * 60 * 60),
            search_radius_km: 5.0,
            radius_growth_factor: 2.0,
            max_search_attempts: 3,
            eta_cadence: Duration::from_secs(30),
            eta_min_displacement_m: 250.0,
            fallback_speed_kmh: 30.0,
            routing_timeout: Duration::from_millis(1_500),
            retry: RetrySettings::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Config::default();

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("compact") | Err(_) => LogFormat::Compact,
            Ok(other) => {
                return Err(AppError::Internal(format!(
                    "invalid LOG_FORMAT: {other}, expected compact/json"
                )));
            }
        };

        let config = Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", defaults.event_buffer_size)?,
            commission_rate: parse_or_default("COMMISSION_RATE", defaults.commission_rate)?,
            request_ttl: secs_or_default("REQUEST_TTL_SECS", defaults.request_ttl)?,
            staleness_threshold: secs_or_default(
                "STALENESS_THRESHOLD_SECS",
                defaults.staleness_threshold,
            )?,
            max_clock_skew: secs_or_default("MAX_CLOCK_SKEW_SECS", defaults.max_clock_skew)?,
            session_retention: secs_or_default(
                "SESSION_RETENTION_SECS",
                defaults.session_retention,
            )?,
            auto_confirm_after: secs_or_default("AUTO_CONFIRM_SECS", defaults.auto_confirm_after)?,
            search_radius_km: parse_or_default("SEARCH_RADIUS_KM", defaults.search_radius_km)?,
            radius_growth_factor: parse_or_default(
                "RADIUS_GROWTH_FACTOR",
                defaults.radius_growth_factor,
            )?,
            max_search_attempts: parse_or_default(
                "MAX_SEARCH_ATTEMPTS",
                defaults.max_search_attempts,
            )?,
            eta_cadence: secs_or_default("ETA_CADENCE_SECS", defaults.eta_cadence)?,
            eta_min_displacement_m: parse_or_default(
                "ETA_MIN_DISPLACEMENT_M",
                defaults.eta_min_displacement_m,
            )?,
            fallback_speed_kmh: parse_or_default("FALLBACK_SPEED_KMH", defaults.fallback_speed_kmh)?,
            routing_timeout: millis_or_default("ROUTING_TIMEOUT_MS", defaults.routing_timeout)?,
            retry: RetrySettings {
                min_delay: millis_or_default("RETRY_MIN_DELAY_MS", defaults.retry.min_delay)?,
                max_delay: millis_or_default("RETRY_MAX_DELAY_MS", defaults.retry.max_delay)?,
                max_times: parse_or_default("RETRY_MAX_TIMES", defaults.retry.max_times)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.commission_rate < Decimal::ZERO || self.commission_rate >= Decimal::ONE {
            return Err(AppError::Internal(format!(
                "invalid COMMISSION_RATE: {} must be in [0, 1)",
                self.commission_rate
            )));
        }
        if self.request_ttl.is_zero() {
            return Err(AppError::Internal(
                "invalid REQUEST_TTL_SECS: must be > 0".to_string(),
            ));
        }
        if self.search_radius_km <= 0.0 || self.radius_growth_factor < 1.0 {
            return Err(AppError::Internal(
                "invalid search radius: SEARCH_RADIUS_KM must be > 0 and RADIUS_GROWTH_FACTOR >= 1"
                    .to_string(),
            ));
        }
        if self.max_search_attempts == 0 {
            return Err(AppError::Internal(
                "invalid MAX_SEARCH_ATTEMPTS: must be > 0".to_string(),
            ));
        }
        Ok(())
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
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

fn secs_or_default(key: &str, default: Duration) -> Result<Duration, AppError> {
    parse_or_default(key, default.as_secs()).map(Duration::from_secs)
}

fn millis_or_default(key: &str, default: Duration) -> Result<Duration, AppError> {
    parse_or_default(key, default.as_millis() as u64).map(Duration::from_millis)
}
