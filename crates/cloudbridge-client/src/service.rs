//! Locally registered service advertisements

use crate::config::{validate_port, ConfigError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What an application asks to advertise
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub port: i32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, port: i32) -> Self {
        Self {
            name: name.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Validate and return the port as `u16`
    pub fn validate(&self) -> Result<u16, ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Missing {
                field: "service name",
            });
        }
        validate_port("service port", self.port)
    }
}

/// A registered service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub healthy: bool,
    pub peer_id: String,
    pub metadata: HashMap<String, String>,
    pub registered_at: DateTime<Utc>,
}

impl Service {
    /// Deterministic identity for a (name, region, port) triple
    pub fn service_id(name: &str, region: &str, port: u16) -> String {
        format!("{}-{}-{}", name, region, port)
    }

    pub(crate) fn register(
        config: ServiceConfig,
        region: &str,
        peer_id: String,
    ) -> Result<Self, ConfigError> {
        let port = config.validate()?;
        let mut metadata = config.metadata;
        metadata
            .entry("region".to_string())
            .or_insert_with(|| region.to_string());

        Ok(Self {
            id: Self::service_id(&config.name, region, port),
            name: config.name,
            port,
            tags: config.tags,
            healthy: true,
            peer_id,
            metadata,
            registered_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_bounds() {
        assert_eq!(ServiceConfig::new("web", 1).validate(), Ok(1));
        assert_eq!(ServiceConfig::new("web", 65535).validate(), Ok(65535));

        for port in [0, -1, 65536] {
            assert!(
                ServiceConfig::new("web", port).validate().is_err(),
                "port {} must be rejected",
                port
            );
        }
    }

    #[test]
    fn test_empty_name_rejected() {
        assert_eq!(
            ServiceConfig::new("", 80).validate(),
            Err(ConfigError::Missing {
                field: "service name"
            })
        );
    }

    #[test]
    fn test_register_derives_id_and_region() {
        let service = Service::register(
            ServiceConfig::new("api", 8080).with_tag("v1"),
            "eu-central",
            "peer-1".to_string(),
        )
        .unwrap();

        assert_eq!(service.id, "api-eu-central-8080");
        assert_eq!(service.metadata.get("region").map(String::as_str), Some("eu-central"));
        assert_eq!(service.peer_id, "peer-1");
        assert!(service.healthy);
        assert_eq!(service.tags, vec!["v1".to_string()]);
    }
}
