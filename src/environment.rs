//! # Runtime Environment
//!
//! The deployment environment is resolved once at startup into a closed enum so
//! backend selection and log configuration never compare raw strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::ConfigurationError;

/// Environment variables consulted in order; the first one set wins
pub const ENVIRONMENT_VARIABLES: [&str; 3] = ["DEAD_LETTER_ENV", "APP_ENV", "RUST_ENV"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    Development,
    Test,
    Staging,
    Production,
}

impl RuntimeEnvironment {
    pub const ALL: [RuntimeEnvironment; 4] = [
        Self::Development,
        Self::Test,
        Self::Staging,
        Self::Production,
    ];

    /// Detect from the process environment, defaulting to development
    pub fn detect() -> Self {
        Self::from_name(&detect_environment_name())
    }

    /// Lenient resolution: names outside the known set are production
    pub fn from_name(name: &str) -> Self {
        name.parse().unwrap_or(Self::Production)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Test => "test",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }

    pub fn is_production_like(&self) -> bool {
        matches!(self, Self::Staging | Self::Production)
    }
}

impl fmt::Display for RuntimeEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeEnvironment {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "test" | "testing" => Ok(Self::Test),
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            other => Err(ConfigurationError::unknown_environment(other)),
        }
    }
}

/// Raw lower-cased environment name from the process environment
pub fn detect_environment_name() -> String {
    ENVIRONMENT_VARIABLES
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| "development".to_string())
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases() {
        assert_eq!("dev".parse::<RuntimeEnvironment>().unwrap(), RuntimeEnvironment::Development);
        assert_eq!("Testing".parse::<RuntimeEnvironment>().unwrap(), RuntimeEnvironment::Test);
        assert_eq!(" PROD ".parse::<RuntimeEnvironment>().unwrap(), RuntimeEnvironment::Production);
    }

    #[test]
    fn unknown_names_fail_strict_parse() {
        assert!("qa-cluster".parse::<RuntimeEnvironment>().is_err());
    }

    #[test]
    fn unknown_names_resolve_to_production() {
        assert_eq!(RuntimeEnvironment::from_name("qa-cluster"), RuntimeEnvironment::Production);
        assert_eq!(RuntimeEnvironment::from_name("staging"), RuntimeEnvironment::Staging);
    }

    #[test]
    fn display_round_trips() {
        for env in RuntimeEnvironment::ALL {
            assert_eq!(env.to_string().parse::<RuntimeEnvironment>().unwrap(), env);
        }
    }

    #[test]
    fn production_like() {
        assert!(RuntimeEnvironment::Staging.is_production_like());
        assert!(!RuntimeEnvironment::Test.is_production_like());
    }
}
