//! Client configuration, read from environment variables.

use url::Url;

use crate::client::{Error, Result, UnauthenticatedClient};

use std::env;
use std::path::PathBuf;

pub const DEFAULT_SNAPSHOT_PATH: &str = ".westwind-user.json";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// REST API root, e.g. `https://westwind.example/api`
    pub api_url: Url,
    /// Permit plain `http` roots for local development
    pub allow_insecure: bool,
    /// Where the last signed-in user is kept
    pub snapshot_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable source. `from_env` uses the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_url = required_from(&lookup, "WESTWIND_API_URL")?;
        let api_url = Url::parse(&raw_url)
            .map_err(|err| Error::Config(format!("WESTWIND_API_URL is invalid: {}", err)))?;

        let allow_insecure = match lookup("WESTWIND_ALLOW_INSECURE") {
            Some(value) => parse_flag(&value).ok_or_else(|| {
                Error::Config(format!("WESTWIND_ALLOW_INSECURE is not a boolean: {}", value))
            })?,
            None => false,
        };

        let snapshot_path = lookup("WESTWIND_SNAPSHOT_PATH")
            .filter(|path| !path.is_empty())
            .unwrap_or_else(|| DEFAULT_SNAPSHOT_PATH.to_string())
            .into();

        Ok(Config {
            api_url,
            allow_insecure,
            snapshot_path,
        })
    }

    pub fn client(&self) -> Result<UnauthenticatedClient> {
        if self.allow_insecure {
            UnauthenticatedClient::new_insecure(self.api_url.clone())
        } else {
            UnauthenticatedClient::new(self.api_url.clone())
        }
    }
}

/// Read a process variable that has no default. Unset and blank values are
/// both configuration errors.
pub fn required_var(name: &str) -> Result<String> {
    required_from(&|name: &str| env::var(name).ok(), name)
}

fn required_from<F>(lookup: &F, name: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| Error::Config(format!("{} must be set", name)))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply() {
        let config = config(&[("WESTWIND_API_URL", "https://westwind.example/api")]).unwrap();
        assert!(!config.allow_insecure);
        assert_eq!(config.snapshot_path, PathBuf::from(DEFAULT_SNAPSHOT_PATH));
        assert!(config.client().is_ok());
    }

    #[test]
    fn missing_url_is_a_config_error() {
        let err = config(&[]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.kind(), crate::client::ErrorKind::Local);
    }

    #[test]
    fn required_vars_reject_unset_and_blank() {
        let vars: HashMap<&str, &str> = [("WESTWIND_UID", "  "), ("WESTWIND_ID_TOKEN", "tok")]
            .into_iter()
            .collect();
        let lookup = |name: &str| vars.get(name).map(|v| v.to_string());

        assert_eq!(required_from(&lookup, "WESTWIND_ID_TOKEN").unwrap(), "tok");
        for name in ["WESTWIND_UID", "WESTWIND_MISSING"] {
            match required_from(&lookup, name) {
                Err(Error::Config(message)) => assert_eq!(message, format!("{} must be set", name)),
                other => panic!("{}: {:?}", name, other),
            }
        }
        assert!(config(&[("WESTWIND_API_URL", "")]).is_err());
    }

    #[test]
    fn insecure_flag_allows_http() {
        let plain = [("WESTWIND_API_URL", "http://localhost:3000/api")];
        assert!(config(&plain).unwrap().client().is_err());

        let config = config(&[
            ("WESTWIND_API_URL", "http://localhost:3000/api"),
            ("WESTWIND_ALLOW_INSECURE", "true"),
            ("WESTWIND_SNAPSHOT_PATH", "/tmp/user.json"),
        ])
        .unwrap();
        assert!(config.allow_insecure);
        assert_eq!(config.snapshot_path, PathBuf::from("/tmp/user.json"));
        assert!(config.client().is_ok());
    }

    #[test]
    fn rejects_garbage_values() {
        assert!(config(&[("WESTWIND_API_URL", "not a url")]).is_err());
        assert!(config(&[
            ("WESTWIND_API_URL", "https://westwind.example/api"),
            ("WESTWIND_ALLOW_INSECURE", "maybe"),
        ])
        .is_err());
    }
}
