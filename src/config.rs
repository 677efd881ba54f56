use std::{env, fmt::Display, path::PathBuf, str::FromStr};

use chrono::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_RECENT_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;
pub const MAX_UPLOAD_BYTES_LIMIT: usize = 100 * 1024 * 1024;
pub const MAX_ACCESS_TTL_MINUTES: i64 = 7 * 24 * 60;
pub const MAX_REFRESH_TTL_DAYS: i64 = 365;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    pub media_dir: PathBuf,
    pub media_url: String,
    /// Page size for recent-review views and list endpoints without `limit`.
    pub recent_limit: u32,
    pub max_upload_bytes: usize,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub expose_author_ids: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            database_path: "reviewdesk.db".into(),
            media_dir: PathBuf::from("media"),
            media_url: "/media".into(),
            recent_limit: DEFAULT_RECENT_LIMIT,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            access_ttl: Duration::minutes(60),
            refresh_ttl: Duration::days(7),
            expose_author_ids: false,
        }
    }
}

impl Config {
    /// Reads `REVIEWDESK_*` variables, falling back to defaults for unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let access_minutes: i64 = try_load(&lookup, "REVIEWDESK_ACCESS_TTL_MINUTES", 60)?;
        let refresh_days: i64 = try_load(&lookup, "REVIEWDESK_REFRESH_TTL_DAYS", 7)?;
        let recent_limit: u32 =
            try_load(&lookup, "REVIEWDESK_RECENT_LIMIT", defaults.recent_limit)?;

        if recent_limit == 0 || recent_limit > MAX_PAGE_LIMIT {
            return Err(ConfigError::Invalid {
                key: "REVIEWDESK_RECENT_LIMIT".into(),
                message: format!("must be between 1 and {MAX_PAGE_LIMIT}"),
            });
        }
        let access_ttl = bounded_ttl(
            "REVIEWDESK_ACCESS_TTL_MINUTES",
            access_minutes,
            MAX_ACCESS_TTL_MINUTES,
            Duration::try_minutes,
        )?;
        let refresh_ttl = bounded_ttl(
            "REVIEWDESK_REFRESH_TTL_DAYS",
            refresh_days,
            MAX_REFRESH_TTL_DAYS,
            Duration::try_days,
        )?;

        let max_upload_bytes = try_load(
            &lookup,
            "REVIEWDESK_MAX_UPLOAD_BYTES",
            defaults.max_upload_bytes,
        )?;
        if max_upload_bytes == 0 || max_upload_bytes > MAX_UPLOAD_BYTES_LIMIT {
            return Err(ConfigError::Invalid {
                key: "REVIEWDESK_MAX_UPLOAD_BYTES".into(),
                message: format!("must be between 1 and {MAX_UPLOAD_BYTES_LIMIT}"),
            });
        }

        Ok(Self {
            host: try_load(&lookup, "REVIEWDESK_HOST", defaults.host)?,
            port: try_load(&lookup, "REVIEWDESK_PORT", defaults.port)?,
            database_path: try_load(&lookup, "REVIEWDESK_DATABASE", defaults.database_path)?,
            media_dir: PathBuf::from(try_load::<String>(
                &lookup,
                "REVIEWDESK_MEDIA_DIR",
                defaults.media_dir.display().to_string(),
            )?),
            media_url: try_load::<String>(&lookup, "REVIEWDESK_MEDIA_URL", defaults.media_url)?
                .trim_end_matches('/')
                .to_string(),
            recent_limit,
            max_upload_bytes,
            access_ttl,
            refresh_ttl,
            expose_author_ids: try_load(
                &lookup,
                "REVIEWDESK_EXPOSE_AUTHOR_IDS",
                defaults.expose_author_ids,
            )?,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Clamps a client-requested page size to `1..=MAX_PAGE_LIMIT`.
    pub fn page_limit(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.recent_limit)
            .clamp(1, MAX_PAGE_LIMIT)
    }
}

/// A TTL in `1..=max` units, built without overflowing.
fn bounded_ttl(
    key: &str,
    value: i64,
    max: i64,
    build: fn(i64) -> Option<Duration>,
) -> Result<Duration, ConfigError> {
    if !(1..=max).contains(&value) {
        return Err(ConfigError::Invalid {
            key: key.into(),
            message: format!("must be between 1 and {max}"),
        });
    }
    build(value).ok_or_else(|| ConfigError::Invalid {
        key: key.into(),
        message: "out of range".into(),
    })
}

fn try_load<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| {
            warn!("Invalid {key} value: {e}");
            ConfigError::Invalid {
                key: key.to_string(),
                message: e.to_string(),
            }
        }),
        None => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.recent_limit, 20);
        assert_eq!(config.max_upload_bytes, 5 * 1024 * 1024);
        assert!(!config.expose_author_ids);
        assert_eq!(config.bind_address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("REVIEWDESK_PORT", "9000"),
            ("REVIEWDESK_MEDIA_URL", "https://cdn.example.com/media/"),
            ("REVIEWDESK_EXPOSE_AUTHOR_IDS", "true"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.media_url, "https://cdn.example.com/media");
        assert!(config.expose_author_ids);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Config::from_lookup(lookup(&[("REVIEWDESK_PORT", "http")])).is_err());
        assert!(Config::from_lookup(lookup(&[("REVIEWDESK_RECENT_LIMIT", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("REVIEWDESK_ACCESS_TTL_MINUTES", "-5")])).is_err());
        assert!(Config::from_lookup(lookup(&[(
            "REVIEWDESK_ACCESS_TTL_MINUTES",
            "9223372036854775807"
        )]))
        .is_err());
        assert!(
            Config::from_lookup(lookup(&[("REVIEWDESK_REFRESH_TTL_DAYS", "100000000")])).is_err()
        );
        assert!(Config::from_lookup(lookup(&[(
            "REVIEWDESK_MAX_UPLOAD_BYTES",
            "18446744073709551615"
        )]))
        .is_err());
        assert!(Config::from_lookup(lookup(&[("REVIEWDESK_MAX_UPLOAD_BYTES", "0")])).is_err());

        let config = Config::from_lookup(lookup(&[
            ("REVIEWDESK_ACCESS_TTL_MINUTES", "10080"),
            ("REVIEWDESK_REFRESH_TTL_DAYS", "365"),
        ]))
        .unwrap();
        assert_eq!(config.access_ttl, Duration::days(7));
        assert_eq!(config.refresh_ttl, Duration::days(365));
    }

    #[test]
    fn test_page_limit_clamps() {
        let config = Config::default();
        assert_eq!(config.page_limit(None), 20);
        assert_eq!(config.page_limit(Some(0)), 1);
        assert_eq!(config.page_limit(Some(500)), MAX_PAGE_LIMIT);
    }
}
