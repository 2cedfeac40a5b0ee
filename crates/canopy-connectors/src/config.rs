//! Flat connector configuration.
//!
//! [`ConnectorConfig`] is a string property map with dotted keys
//! (`relay.url`, `reconnect.max.attempts`, ...). Typed configs are built
//! from it with `from_config` constructors that parse and validate each key.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::ConnectorError;

/// Untyped connector configuration: a name plus a dotted-key property map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectorConfig {
    connector_type: String,
    properties: BTreeMap<String, String>,
}

impl ConnectorConfig {
    /// Creates an empty configuration for the named connector.
    #[must_use]
    pub fn new(connector_type: impl Into<String>) -> Self {
        Self {
            connector_type: connector_type.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Builds a configuration from environment-style variables.
    ///
    /// Every variable starting with `prefix` is mapped to a property by
    /// stripping the prefix, lowercasing, and turning `_` into `.`, so
    /// `CANOPY_RELAY_URL` becomes `relay.url`.
    #[must_use]
    pub fn from_env_vars<I>(connector_type: impl Into<String>, prefix: &str, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self::new(connector_type);
        for (key, value) in vars {
            if let Some(rest) = key.strip_prefix(prefix) {
                if rest.is_empty() {
                    continue;
                }
                let property = rest.to_lowercase().replace('_', ".");
                config.set(property, value);
            }
        }
        config
    }

    /// Returns the connector type name.
    #[must_use]
    pub fn connector_type(&self) -> &str {
        &self.connector_type
    }

    /// Sets a property, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Builder-style variant of [`set`](Self::set).
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Returns the raw value of a property. Blank values count as absent.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Returns a required property.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::MissingConfig` if the key is absent or blank.
    pub fn require(&self, key: &str) -> Result<&str, ConnectorError> {
        self.get(key)
            .ok_or_else(|| ConnectorError::MissingConfig(key.to_string()))
    }

    /// Parses a property into `T`, returning `None` when it is absent.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ConfigurationError` if the value is present
    /// but does not parse.
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>, ConnectorError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|e| {
                ConnectorError::ConfigurationError(format!("invalid value for '{key}': {e}"))
            }),
        }
    }

    /// Returns all properties.
    #[must_use]
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_require() {
        let config = ConnectorConfig::new("firehose")
            .with_property("relay.url", "wss://relay.example")
            .with_property("blank", "   ");

        assert_eq!(config.connector_type(), "firehose");
        assert_eq!(config.get("relay.url"), Some("wss://relay.example"));
        assert_eq!(config.get("blank"), None);
        assert!(config.require("relay.url").is_ok());
        assert!(matches!(
            config.require("missing"),
            Err(ConnectorError::MissingConfig(k)) if k == "missing"
        ));
    }

    #[test]
    fn test_get_parsed() {
        let config = ConnectorConfig::new("firehose")
            .with_property("cursor", "42")
            .with_property("bad", "forty-two");

        assert_eq!(config.get_parsed::<u64>("cursor").unwrap(), Some(42));
        assert_eq!(config.get_parsed::<u64>("absent").unwrap(), None);
        let err = config.get_parsed::<u64>("bad").unwrap_err();
        assert!(err.to_string().contains("'bad'"));
    }

    #[test]
    fn test_from_env_vars() {
        let vars = vec![
            ("CANOPY_RELAY_URL".to_string(), "wss://relay".to_string()),
            (
                "CANOPY_RECONNECT_MAX_ATTEMPTS".to_string(),
                "3".to_string(),
            ),
            ("CANOPY_".to_string(), "ignored".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        let config = ConnectorConfig::from_env_vars("firehose", "CANOPY_", vars);

        assert_eq!(config.get("relay.url"), Some("wss://relay"));
        assert_eq!(config.get("reconnect.max.attempts"), Some("3"));
        assert_eq!(config.properties().len(), 2);
    }
}
