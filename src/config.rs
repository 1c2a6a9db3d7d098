//! Configuration loading and validation.
//!
//! Settings are parsed once at startup into fully-typed values
//! ("parse-then-construct"); anything that fails validation aborts the
//! process rather than being re-checked on every read. The merge order
//! (environment overrides the YAML file) mirrors the `config` crate's own
//! layering.

use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::github::GitHubConfig;
use crate::runner_group::RunnerGroup;

const CONFIG_PATH_ENV: &str = "RUNNER_MANAGER_CONFIG";
const ENV_PREFIX: &str = "RUNNER_MANAGER";

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warning,
    Debug,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Debug => "debug",
            LogLevel::Error => "error",
        }
    }
}

/// A duration parsed from either a bare integer number of seconds or a
/// small ISO-8601 subset (`PT15M`, `PT1H`, `PT30S`, `PT1H30M`).
#[derive(Clone, Copy, Debug)]
pub struct ParsedDuration(pub Duration);

impl ParsedDuration {
    pub fn as_duration(self) -> Duration {
        self.0
    }

    fn parse(raw: &str) -> Result<Duration, ConfigError> {
        if let Ok(seconds) = raw.parse::<u64>() {
            return Ok(Duration::from_secs(seconds));
        }

        let err = || ConfigError::InvalidDuration(raw.to_string());
        let rest = raw.strip_prefix("PT").ok_or_else(err)?;
        if rest.is_empty() {
            return Err(err());
        }

        let mut seconds: u64 = 0;
        let mut number = String::new();
        for c in rest.chars() {
            match c {
                '0'..='9' => number.push(c),
                'H' | 'M' | 'S' => {
                    let n: u64 = number.parse().map_err(|_| err())?;
                    number.clear();
                    seconds += match c {
                        'H' => n * 3600,
                        'M' => n * 60,
                        'S' => n,
                        _ => unreachable!(),
                    };
                }
                _ => return Err(err()),
            }
        }
        if !number.is_empty() {
            return Err(err());
        }
        Ok(Duration::from_secs(seconds))
    }
}

impl<'de> Deserialize<'de> for ParsedDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Seconds(u64),
            Text(String),
        }
        let repr = Repr::deserialize(deserializer)?;
        let duration = match repr {
            Repr::Seconds(s) => Duration::from_secs(s),
            Repr::Text(s) => ParsedDuration::parse(&s).map_err(serde::de::Error::custom)?,
        };
        Ok(ParsedDuration(duration))
    }
}

fn default_timeout_runner() -> ParsedDuration {
    ParsedDuration(Duration::from_secs(15 * 60))
}

fn default_time_to_live() -> ParsedDuration {
    ParsedDuration(Duration::from_secs(12 * 3600))
}

fn default_healthcheck_interval() -> ParsedDuration {
    ParsedDuration(Duration::from_secs(15 * 60))
}

fn default_indexing_interval() -> ParsedDuration {
    ParsedDuration(Duration::from_secs(3600))
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    pub name: String,
    #[serde(default)]
    pub store_url: Option<String>,
    pub api_key: String,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    pub runner_groups: Vec<RunnerGroup>,

    #[serde(default = "default_timeout_runner")]
    pub timeout_runner: ParsedDuration,
    #[serde(default = "default_time_to_live")]
    pub time_to_live: ParsedDuration,
    #[serde(default = "default_healthcheck_interval")]
    pub healthcheck_interval: ParsedDuration,
    #[serde(default = "default_indexing_interval")]
    pub indexing_interval: ParsedDuration,

    #[serde(flatten)]
    pub github: GitHubConfig,
}

impl Settings {
    /// Load the YAML file named by `RUNNER_MANAGER_CONFIG` (default
    /// `config.yaml`), merge `RUNNER_MANAGER__`-prefixed environment
    /// overrides on top, then validate every value.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config".to_string());

        let raw = config::Config::builder()
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = raw.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.github.validate().map_err(|_| ConfigError::MissingAuth)?;

        let mut seen = std::collections::HashSet::new();
        for group in &self.runner_groups {
            group.validate()?;
            if !seen.insert(group.name.clone()) {
                return Err(ConfigError::DuplicateGroup(group.name.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_seconds() {
        let d = ParsedDuration::parse("90").unwrap();
        assert_eq!(d, Duration::from_secs(90));
    }

    #[test]
    fn parses_iso8601_subset() {
        assert_eq!(ParsedDuration::parse("PT15M").unwrap(), Duration::from_secs(900));
        assert_eq!(ParsedDuration::parse("PT1H").unwrap(), Duration::from_secs(3600));
        assert_eq!(ParsedDuration::parse("PT1H30M").unwrap(), Duration::from_secs(5400));
    }

    #[test]
    fn rejects_malformed_duration() {
        assert!(ParsedDuration::parse("not-a-duration").is_err());
        assert!(ParsedDuration::parse("PT").is_err());
    }
}
