// ./api/src/config.rs
use application::{ConflictPolicy, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

pub const DEFAULT_PORT: u16 = 3000;

/// Server settings read from the environment.
///
/// | variable | meaning | default |
/// |---|---|---|
/// | `PORT` | listen port | 3000 |
/// | `SENSORS_DB` | SQLite file; unset means in-memory storage | unset |
/// | `SENSORS_CONFLICT_POLICY` | `replace` or `reject` | `reject` with SQLite, else `replace` |
/// | `SENSORS_PAGE_SIZE` | page size when a request has no `_count` | 5 |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub database: Option<PathBuf>,
    pub conflict_policy: ConflictPolicy,
    pub page_size: usize,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from `lookup`; bad values are logged and replaced by defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let port = parse_or("PORT", lookup("PORT"), DEFAULT_PORT, |_| true);

        let database = lookup("SENSORS_DB")
            .map(|path| path.trim().to_string())
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        let default_policy = match database {
            Some(_) => ConflictPolicy::Reject,
            None => ConflictPolicy::Replace,
        };
        let conflict_policy = parse_or(
            "SENSORS_CONFLICT_POLICY",
            lookup("SENSORS_CONFLICT_POLICY"),
            default_policy,
            |_| true,
        );

        let page_size = parse_or(
            "SENSORS_PAGE_SIZE",
            lookup("SENSORS_PAGE_SIZE"),
            DEFAULT_PAGE_SIZE,
            |size| (1..=MAX_PAGE_SIZE).contains(size),
        );

        Self {
            port,
            database,
            conflict_policy,
            page_size,
        }
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T, valid: impl Fn(&T) -> bool) -> T
where
    T: FromStr + std::fmt::Debug,
{
    let Some(raw) = raw else {
        info!("{} not set. Using default {:?}.", key, default);
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => {
            info!("Using {} = {:?} from environment.", key, value);
            value
        }
        _ => {
            warn!(
                "Invalid {} value '{}' in environment. Using default {:?}.",
                key, raw, default
            );
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_to_in_memory_upserts() {
        let config = config_from(&[]);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.database, None);
        assert_eq!(config.conflict_policy, ConflictPolicy::Replace);
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn database_switches_default_policy_to_reject() {
        let config = config_from(&[("SENSORS_DB", "/tmp/sensors.db")]);
        assert_eq!(config.database, Some(PathBuf::from("/tmp/sensors.db")));
        assert_eq!(config.conflict_policy, ConflictPolicy::Reject);

        let config = config_from(&[
            ("SENSORS_DB", "/tmp/sensors.db"),
            ("SENSORS_CONFLICT_POLICY", "replace"),
        ]);
        assert_eq!(config.conflict_policy, ConflictPolicy::Replace);
    }

    #[test]
    fn bad_values_fall_back() {
        let config = config_from(&[
            ("PORT", "http"),
            ("SENSORS_DB", "  "),
            ("SENSORS_CONFLICT_POLICY", "merge"),
            ("SENSORS_PAGE_SIZE", "0"),
        ]);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.database, None);
        assert_eq!(config.conflict_policy, ConflictPolicy::Replace);
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn valid_values_are_used() {
        let config = config_from(&[("PORT", "8080"), ("SENSORS_PAGE_SIZE", "20")]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.page_size, 20);
    }
}
