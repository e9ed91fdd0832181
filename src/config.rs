use std::path::PathBuf;
use std::time::Duration;

use chrono::{FixedOffset, NaiveDate, Offset, Utc};

use crate::error::{AppError, Result};
use crate::types::Category;
use crate::upstream::{Credentials, Secret};

pub const TOKEN_URL: &str = "https://oauth.iracing.com/oauth2/token";
pub const DATA_URL_TEMPLATE: &str =
    "https://members-ng.iracing.com/data/driver_stats_by_category/{category}";

/// Upstream marker for a member without a rating yet.
pub const UNRATED_VALUE: i64 = -1;

/// Value an unrated member is assumed to start from when computing growth.
pub const PROVISIONAL_START_VALUE: i64 = 1500;

/// Token lifetime assumed when the token endpoint omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 600;

/// Minimum search term length for the member directory.
pub const MIN_SEARCH_TERM_LEN: usize = 3;

/// Category used by the HTTP surface when none is given.
pub const DEFAULT_CATEGORY: &str = "sports_car";

/// Cached growers rankings expire at this local time of day.
pub const RANKING_CACHE_EXPIRY_HOUR: u32 = 23;
pub const RANKING_CACHE_EXPIRY_MINUTE: u32 = 55;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub api_port: u16,
    pub db_path: String,
    pub snapshots_dir: PathBuf,
    /// Configured categories (CATEGORIES, comma-separated)
    pub categories: Vec<Category>,

    pub upstream_username: Option<String>,
    pub upstream_password: Option<String>,
    pub upstream_client_id: String,
    pub upstream_client_secret: Option<String>,
    pub upstream_scope: String,
    pub token_url: String,
    /// Must contain `{category}`
    pub data_url_template: String,
    pub http_timeout: Duration,
    /// Renew tokens this long before they expire (TOKEN_SAFETY_MARGIN_SECS)
    pub token_safety_margin: Duration,

    pub rate_limit_rpm: u32,
    pub rate_limit_burst: u32,
    /// Optional hard deadline for a single rate-limit wait
    pub rate_limit_max_wait: Option<Duration>,

    /// Minutes east of UTC used to pick the snapshot calendar day
    pub utc_offset_minutes: i32,
    pub schedule_hour: u32,
    pub schedule_minute: u32,
    pub scheduler_enabled: bool,

    pub admin_secret: Option<String>,
    pub growers_default_limit: usize,
    pub growers_max_limit: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let categories = env_or("CATEGORIES", DEFAULT_CATEGORY)
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Category::parse)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| AppError::Config(format!("CATEGORIES: {e}")))?;
        if categories.is_empty() {
            return Err(AppError::Config("CATEGORIES must list at least one category".to_string()));
        }

        let data_url_template = env_or("UPSTREAM_DATA_URL", DATA_URL_TEMPLATE);
        if !data_url_template.contains("{category}") {
            return Err(AppError::Config(
                "UPSTREAM_DATA_URL must contain a {category} placeholder".to_string(),
            ));
        }

        let utc_offset_minutes = parse_env("UTC_OFFSET_MINUTES", 0i32)?;
        if offset_from_minutes(utc_offset_minutes).is_none() {
            return Err(AppError::Config("UTC_OFFSET_MINUTES is out of range".to_string()));
        }

        let schedule_hour = parse_env("SCHEDULE_HOUR", 0u32)?;
        let schedule_minute = parse_env("SCHEDULE_MINUTE", 0u32)?;
        if schedule_hour > 23 || schedule_minute > 59 {
            return Err(AppError::Config("SCHEDULE_HOUR/SCHEDULE_MINUTE out of range".to_string()));
        }

        let rate_limit_rpm = parse_env("RATE_LIMIT_RPM", 60u32)?;
        let rate_limit_burst = parse_env("RATE_LIMIT_BURST", 5u32)?;
        if rate_limit_rpm == 0 || rate_limit_burst == 0 {
            return Err(AppError::Config("RATE_LIMIT_RPM and RATE_LIMIT_BURST must be positive".to_string()));
        }

        let growers_default_limit = parse_env("GROWERS_DEFAULT_LIMIT", 20usize)?;
        let growers_max_limit = parse_env("GROWERS_MAX_LIMIT", 100usize)?;
        if growers_default_limit == 0 || growers_default_limit > growers_max_limit {
            return Err(AppError::Config(
                "GROWERS_DEFAULT_LIMIT must be between 1 and GROWERS_MAX_LIMIT".to_string(),
            ));
        }

        let http_timeout = Duration::try_from_secs_f64(parse_env("HTTP_TIMEOUT_SECS", 15.0f64)?)
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| AppError::Config("HTTP_TIMEOUT_SECS must be a positive number".to_string()))?;

        Ok(Self {
            log_level: env_or("LOG_LEVEL", "info"),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            db_path: env_or("DB_PATH", "drivers-scout.db"),
            snapshots_dir: PathBuf::from(env_or("SNAPSHOTS_DIR", "snapshots")),
            categories,
            upstream_username: env_opt("UPSTREAM_USERNAME"),
            upstream_password: env_opt("UPSTREAM_PASSWORD"),
            upstream_client_id: env_or("UPSTREAM_CLIENT_ID", "ar-pwlimited"),
            upstream_client_secret: env_opt("UPSTREAM_CLIENT_SECRET"),
            upstream_scope: env_or("UPSTREAM_SCOPE", "iracing.auth"),
            token_url: env_or("UPSTREAM_TOKEN_URL", TOKEN_URL),
            data_url_template,
            http_timeout,
            token_safety_margin: Duration::from_secs(parse_env("TOKEN_SAFETY_MARGIN_SECS", 60u64)?),
            rate_limit_rpm,
            rate_limit_burst,
            rate_limit_max_wait: env_opt("RATE_LIMIT_MAX_WAIT_SECS")
                .map(|s| {
                    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                        AppError::Config("RATE_LIMIT_MAX_WAIT_SECS must be an integer".to_string())
                    })
                })
                .transpose()?,
            utc_offset_minutes,
            schedule_hour,
            schedule_minute,
            scheduler_enabled: parse_env("SCHEDULER_ENABLED", true)?,
            admin_secret: env_opt("ADMIN_SECRET"),
            growers_default_limit,
            growers_max_limit,
        })
    }

    /// Upstream credentials; only commands that talk to upstream need them.
    pub fn credentials(&self) -> Result<Credentials> {
        let require = |value: &Option<String>, name: &str| {
            value
                .clone()
                .ok_or_else(|| AppError::Config(format!("{name} must be set")))
        };
        Ok(Credentials {
            username: require(&self.upstream_username, "UPSTREAM_USERNAME")?,
            password: Secret::new(require(&self.upstream_password, "UPSTREAM_PASSWORD")?),
            client_id: self.upstream_client_id.clone(),
            client_secret: Secret::new(require(
                &self.upstream_client_secret,
                "UPSTREAM_CLIENT_SECRET",
            )?),
            scope: self.upstream_scope.clone(),
        })
    }

    pub fn utc_offset(&self) -> FixedOffset {
        offset_from_minutes(self.utc_offset_minutes).unwrap_or(Utc.fix())
    }

    /// Snapshot calendar day for "now".
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.utc_offset()).date_naive()
    }

    pub fn is_configured(&self, category: &Category) -> bool {
        self.categories.contains(category)
    }

    /// Parses a user-supplied category and checks it against the configured set.
    pub fn resolve_category(&self, raw: Option<&str>) -> Result<Category> {
        let category = Category::parse(raw.unwrap_or(DEFAULT_CATEGORY))?;
        if !self.is_configured(&category) {
            return Err(AppError::UnknownCategory(category.to_string()));
        }
        Ok(category)
    }
}

/// `None` unless the offset is strictly inside ±24h.
fn offset_from_minutes(minutes: i32) -> Option<FixedOffset> {
    minutes.checked_mul(60).and_then(FixedOffset::east_opt)
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env_opt(name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{name} has an invalid value: {raw}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
impl Config {
    /// Config with defaults and no environment lookups.
    pub fn for_tests(snapshots_dir: PathBuf) -> Self {
        Self {
            log_level: "debug".to_string(),
            api_port: 0,
            db_path: ":memory:".to_string(),
            snapshots_dir,
            categories: vec![
                Category::parse("sports_car").unwrap(),
                Category::parse("formula_car").unwrap(),
            ],
            upstream_username: Some("user@example.com".to_string()),
            upstream_password: Some("hunter2".to_string()),
            upstream_client_id: "ar-pwlimited".to_string(),
            upstream_client_secret: Some("client-secret".to_string()),
            upstream_scope: "iracing.auth".to_string(),
            token_url: TOKEN_URL.to_string(),
            data_url_template: DATA_URL_TEMPLATE.to_string(),
            http_timeout: Duration::from_secs(5),
            token_safety_margin: Duration::from_secs(60),
            rate_limit_rpm: 600,
            rate_limit_burst: 10,
            rate_limit_max_wait: None,
            utc_offset_minutes: 0,
            schedule_hour: 0,
            schedule_minute: 0,
            scheduler_enabled: false,
            admin_secret: None,
            growers_default_limit: 20,
            growers_max_limit: 100,
        }
    }
}
