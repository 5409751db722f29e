use crate::translate::{compile_subscribe_pattern, count_placeholders, TranslateError};
use log::{error, info};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Payload layout of a gateway direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Schema {
    /// One topic per node, the body is a JSON object of key/value pairs.
    #[default]
    Json,
    /// One topic per (node, key), the body is the raw value.
    Value,
}

impl Schema {
    /// Number of placeholders/captures this schema consumes: the node
    /// address, plus the key for `Value`.
    pub fn arity(self) -> usize {
        match self {
            Schema::Json => 1,
            Schema::Value => 2,
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schema::Json => write!(f, "json"),
            Schema::Value => write!(f, "value"),
        }
    }
}

pub const DEFAULT_SUBSCRIBE_TOPIC: &str = "#";
pub const DEFAULT_SUBSCRIBE_PATTERN: &str = ".*/(.*)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub name: String,
    pub subscribe_topic: String,
    pub subscribe_schema: Schema,
    pub subscribe_pattern: String,
    pub publish_schema: Schema,
    pub publish_pattern: String,
}

impl GatewayConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribe_topic: DEFAULT_SUBSCRIBE_TOPIC.to_string(),
            subscribe_schema: Schema::Json,
            subscribe_pattern: DEFAULT_SUBSCRIBE_PATTERN.to_string(),
            publish_schema: Schema::Json,
            publish_pattern: String::new(),
        }
    }

    pub fn subscribe(mut self, topic: &str, schema: Schema, pattern: &str) -> Self {
        self.subscribe_topic = topic.to_string();
        self.subscribe_schema = schema;
        self.subscribe_pattern = pattern.to_string();
        self
    }

    pub fn publish(mut self, schema: Schema, pattern: &str) -> Self {
        self.publish_schema = schema;
        self.publish_pattern = pattern.to_string();
        self
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DirectionSection {
    topic: Option<String>,
    schema: Option<Schema>,
    pattern: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GatewaySection {
    subscribe: Option<DirectionSection>,
    publish: Option<DirectionSection>,
}

impl GatewaySection {
    fn into_config(self, name: String) -> Result<GatewayConfig, RegistryError> {
        let mut gateway = GatewayConfig::new(name);

        if let Some(subscribe) = self.subscribe {
            if let Some(topic) = subscribe.topic {
                gateway.subscribe_topic = topic;
            }
            if let Some(schema) = subscribe.schema {
                gateway.subscribe_schema = schema;
            }
            if let Some(pattern) = subscribe.pattern {
                gateway.subscribe_pattern = pattern;
            }
        }

        if let Some(publish) = self.publish {
            if publish.topic.is_some() {
                return Err(RegistryError::Parse(format!(
                    "gateway '{}': publish section does not take a topic",
                    gateway.name
                )));
            }
            if let Some(schema) = publish.schema {
                gateway.publish_schema = schema;
            }
            if let Some(pattern) = publish.pattern {
                gateway.publish_pattern = pattern;
            }
        }

        Ok(gateway)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot read gateways config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse gateways config: {0}")]
    Parse(String),
    #[error("duplicate gateway name '{0}'")]
    DuplicateName(String),
    #[error("gateway '{name}' has an empty subscribe topic")]
    EmptyTopic { name: String },
    #[error("gateway '{name}' has an invalid pattern: {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: TranslateError,
    },
    #[error("gateway '{name}': subscribe pattern yields {found} capture(s), {schema} schema needs {expected}")]
    CaptureMismatch {
        name: String,
        schema: Schema,
        expected: usize,
        found: usize,
    },
    #[error("gateway '{name}': publish pattern has {found} placeholder(s), {schema} schema needs {expected}")]
    PublishPlaceholders {
        name: String,
        schema: Schema,
        expected: usize,
        found: usize,
    },
    #[error("gateway '{0}' not found")]
    NotFound(String),
}

/// Ordered, immutable set of gateway definitions. Config file order is the
/// matching precedence.
#[derive(Debug, Clone)]
pub struct GatewayRegistry {
    gateways: Vec<GatewayConfig>,
}

impl GatewayRegistry {
    /// Validates the list and builds the registry.
    pub fn new(gateways: Vec<GatewayConfig>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();

        for gateway in &gateways {
            if !seen.insert(gateway.name.as_str()) {
                return Err(RegistryError::DuplicateName(gateway.name.clone()));
            }
            validate(gateway)?;
        }

        Ok(Self { gateways })
    }

    /// Reads, parses and validates a YAML gateways file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let registry = Self::from_yaml_str(&raw)?;
        info!(
            "Loaded {} gateway(s) from {}",
            registry.len(),
            path.display()
        );
        Ok(registry)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, RegistryError> {
        // Mapping keeps file order
        let document: serde_yaml::Mapping =
            serde_yaml::from_str(raw).map_err(|e| RegistryError::Parse(e.to_string()))?;

        let mut gateways = Vec::with_capacity(document.len());
        for (key, value) in document {
            let name = match key {
                serde_yaml::Value::String(name) => name,
                other => {
                    return Err(RegistryError::Parse(format!(
                        "gateway name must be a string, got {:?}",
                        other
                    )))
                }
            };

            let section: GatewaySection = if value.is_null() {
                GatewaySection::default()
            } else {
                serde_yaml::from_value(value)
                    .map_err(|e| RegistryError::Parse(format!("gateway '{}': {}", name, e)))?
            };

            gateways.push(section.into_config(name)?);
        }

        Self::new(gateways)
    }

    /// Looks a gateway up by name.
    pub fn find(&self, name: &str) -> Result<&GatewayConfig, RegistryError> {
        self.gateways
            .iter()
            .find(|gateway| gateway.name == name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn all(&self) -> &[GatewayConfig] {
        &self.gateways
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.gateways.iter().map(|gateway| gateway.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }
}

fn validate(gateway: &GatewayConfig) -> Result<(), RegistryError> {
    if gateway.subscribe_topic.trim().is_empty() {
        return Err(RegistryError::EmptyTopic {
            name: gateway.name.clone(),
        });
    }

    let matcher = compile_subscribe_pattern(&gateway.subscribe_pattern).map_err(|source| {
        error!(
            "Gateway '{}' subscribe pattern '{}' rejected",
            gateway.name, gateway.subscribe_pattern
        );
        RegistryError::InvalidPattern {
            name: gateway.name.clone(),
            source,
        }
    })?;

    let found = matcher.captures_len() - 1;
    let expected = gateway.subscribe_schema.arity();
    if found != expected {
        return Err(RegistryError::CaptureMismatch {
            name: gateway.name.clone(),
            schema: gateway.subscribe_schema,
            expected,
            found,
        });
    }

    // An empty publish pattern leaves the gateway read-only.
    if !gateway.publish_pattern.is_empty() {
        let found = count_placeholders(&gateway.publish_pattern).map_err(|source| {
            RegistryError::InvalidPattern {
                name: gateway.name.clone(),
                source,
            }
        })?;
        let expected = gateway.publish_schema.arity();
        if found != expected {
            return Err(RegistryError::PublishPlaceholders {
                name: gateway.name.clone(),
                schema: gateway.publish_schema,
                expected,
                found,
            });
        }
    }

    Ok(())
}
