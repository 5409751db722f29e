//! Topic/payload translation between MQTT and hub coordinates.
//!
//! Gateway patterns use positional placeholders: `{}` takes the next
//! argument, `{0}`/`{1}` pick one explicitly and `{{`/`}}` are literal braces.
//! Subscribe patterns are regular expressions whose placeholders become
//! `(.*)` capture groups; publish patterns are plain topic templates.

use crate::gateway::{GatewayConfig, GatewayRegistry, Schema};
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

const CAPTURE_ANY: &str = "(.*)";

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("malformed template '{template}': {reason}")]
    BadTemplate { template: String, reason: String },
    #[error("template '{template}' references argument {index} but only {given} given")]
    MissingArgument {
        template: String,
        index: usize,
        given: usize,
    },
    #[error("invalid regular expression: {0}")]
    Regex(#[from] regex::Error),
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("JSON payload is not an object")]
    NotAnObject,
    #[error("payload is not ASCII text")]
    NotAscii,
    #[error("gateway '{0}' has no publish pattern")]
    PublishNotConfigured(String),
    #[error("cannot serialize publish payload: {0}")]
    Serialize(#[source] serde_json::Error),
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    LeftBrace,
    RightBrace,
    Argument(usize),
}

fn bad_template(template: &str, reason: &str) -> TranslateError {
    TranslateError::BadTemplate {
        template: template.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_template(template: &str) -> Result<Vec<Segment<'_>>, TranslateError> {
    let bytes = template.as_bytes();
    let mut segments = Vec::new();
    let mut next_auto = 0;
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' | b'}' if bytes.get(i + 1) == Some(&bytes[i]) => {
                if literal_start < i {
                    segments.push(Segment::Literal(&template[literal_start..i]));
                }
                segments.push(if bytes[i] == b'{' {
                    Segment::LeftBrace
                } else {
                    Segment::RightBrace
                });
                i += 2;
                literal_start = i;
            }
            b'{' => {
                if literal_start < i {
                    segments.push(Segment::Literal(&template[literal_start..i]));
                }
                let close = template[i..]
                    .find('}')
                    .map(|offset| i + offset)
                    .ok_or_else(|| bad_template(template, "unclosed '{'"))?;
                let inner = &template[i + 1..close];
                let index = if inner.is_empty() {
                    next_auto += 1;
                    next_auto - 1
                } else {
                    inner
                        .parse::<usize>()
                        .map_err(|_| bad_template(template, "placeholders must be '{}' or '{<index>}'"))?
                };
                segments.push(Segment::Argument(index));
                i = close + 1;
                literal_start = i;
            }
            b'}' => return Err(bad_template(template, "single '}' encountered")),
            _ => i += 1,
        }
    }

    if literal_start < bytes.len() {
        segments.push(Segment::Literal(&template[literal_start..]));
    }

    Ok(segments)
}

/// Substitutes positional arguments into a template.
pub fn format_template(template: &str, args: &[&str]) -> Result<String, TranslateError> {
    let mut out = String::with_capacity(template.len());

    for segment in parse_template(template)? {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::LeftBrace => out.push('{'),
            Segment::RightBrace => out.push('}'),
            Segment::Argument(index) => {
                let arg = args.get(index).ok_or_else(|| TranslateError::MissingArgument {
                    template: template.to_string(),
                    index,
                    given: args.len(),
                })?;
                out.push_str(arg);
            }
        }
    }

    Ok(out)
}

/// Number of positional arguments a template consumes.
pub fn count_placeholders(template: &str) -> Result<usize, TranslateError> {
    Ok(parse_template(template)?
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Argument(index) => Some(index + 1),
            _ => None,
        })
        .max()
        .unwrap_or(0))
}

/// Builds the full-string matcher for a subscribe pattern.
pub fn compile_subscribe_pattern(pattern: &str) -> Result<Regex, TranslateError> {
    let expanded = format_template(pattern, &[CAPTURE_ANY, CAPTURE_ANY])?;
    Ok(Regex::new(&format!("^(?:{})$", expanded))?)
}

/// A sensor reading decoded from one MQTT message.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub gateway: String,
    pub node_address: String,
    pub fields: Map<String, Value>,
}

impl SensorReading {
    /// Payload of the hub's `sensor_addr_response` event.
    pub fn to_hub_payload(&self) -> Value {
        let mut payload = Map::new();
        payload.insert(self.node_address.clone(), Value::Object(self.fields.clone()));
        Value::Object(payload)
    }
}

/// Logical coordinates extracted from a topic, before the body is decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMatch<'a> {
    pub gateway: &'a str,
    pub schema: Schema,
    pub node_address: String,
    pub key: Option<String>,
}

#[derive(Debug)]
struct Matcher {
    gateway: String,
    schema: Schema,
    regex: Regex,
}

/// Inbound side of the bridge: maps MQTT topics to gateway coordinates.
#[derive(Debug)]
pub struct PatternTranslator {
    matchers: Vec<Matcher>,
}

impl PatternTranslator {
    pub fn new(registry: &GatewayRegistry) -> Result<Self, TranslateError> {
        Self::from_gateways(registry.all())
    }

    pub fn from_gateways(gateways: &[GatewayConfig]) -> Result<Self, TranslateError> {
        let matchers = gateways
            .iter()
            .map(|gateway| {
                Ok(Matcher {
                    gateway: gateway.name.clone(),
                    schema: gateway.subscribe_schema,
                    regex: compile_subscribe_pattern(&gateway.subscribe_pattern)?,
                })
            })
            .collect::<Result<Vec<_>, TranslateError>>()?;

        Ok(Self { matchers })
    }

    /// First gateway, in registry order, whose pattern matches the whole
    /// topic with the capture count its schema expects.
    pub fn match_topic(&self, topic: &str) -> Option<TopicMatch<'_>> {
        self.matchers.iter().find_map(|matcher| {
            let captures = matcher.regex.captures(topic)?;
            if captures.len() - 1 != matcher.schema.arity() {
                return None;
            }

            let group = |i: usize| {
                captures
                    .get(i)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default()
            };

            Some(TopicMatch {
                gateway: &matcher.gateway,
                schema: matcher.schema,
                node_address: group(1),
                key: match matcher.schema {
                    Schema::Json => None,
                    Schema::Value => Some(group(2)),
                },
            })
        })
    }

    /// Translates one MQTT message. `Ok(None)` means no gateway claims the
    /// topic; an error means the claiming gateway could not decode the body.
    pub fn translate(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<Option<SensorReading>, TranslateError> {
        let Some(matched) = self.match_topic(topic) else {
            return Ok(None);
        };

        let fields = match (matched.schema, matched.key) {
            (Schema::Value, Some(key)) => {
                if !payload.is_ascii() {
                    return Err(TranslateError::NotAscii);
                }
                // ASCII is valid UTF-8
                let text = String::from_utf8_lossy(payload).into_owned();
                let mut fields = Map::new();
                fields.insert(key, Value::String(text));
                fields
            }
            _ => match serde_json::from_slice::<Value>(payload).map_err(TranslateError::InvalidJson)? {
                Value::Object(fields) => fields,
                _ => return Err(TranslateError::NotAnObject),
            },
        };

        Ok(Some(SensorReading {
            gateway: matched.gateway.to_string(),
            node_address: matched.node_address,
            fields,
        }))
    }
}

/// One outbound MQTT message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: String,
}

/// Outbound side: turns an actuator write into MQTT publishes according to
/// the gateway's publish schema.
pub fn build_publish(
    gateway: &GatewayConfig,
    node_address: &str,
    fields: &Map<String, Value>,
) -> Result<Vec<PublishRequest>, TranslateError> {
    if gateway.publish_pattern.is_empty() {
        return Err(TranslateError::PublishNotConfigured(gateway.name.clone()));
    }

    match gateway.publish_schema {
        Schema::Json => Ok(vec![PublishRequest {
            topic: format_template(&gateway.publish_pattern, &[node_address])?,
            payload: serde_json::to_string(fields).map_err(TranslateError::Serialize)?,
        }]),
        Schema::Value => fields
            .iter()
            .map(|(key, value)| {
                Ok(PublishRequest {
                    topic: format_template(&gateway.publish_pattern, &[node_address, key])?,
                    payload: value_text(value),
                })
            })
            .collect(),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
