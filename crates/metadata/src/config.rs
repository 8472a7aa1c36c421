//! Top-level configuration document.
//!
//! Scalar knobs arrive as strings in the file model and are parsed into
//! typed values at load; a bad knob is fatal. The returned [`Config`] is
//! immutable for the life of the process.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::resource::{ItemMapping, Resource};
use crate::session::SessionConfig;

/// Accept-Encoding preference for upstream requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpEncoding {
    Identity,
    Deflate,
    Gzip,
}

/// HTTP and scheduling knobs, parsed from their string form.
#[derive(Debug, Clone)]
pub struct Knobs {
    /// Publication interval in seconds.
    pub interval_secs: u64,
    /// Reference time-of-day anchoring the publication grid.
    pub time_offset_constant: NaiveTime,
    /// Scheduler drift tolerated before a warning, in milliseconds.
    pub tolerable_delay_ms: u64,
    /// Retry rounds per cycle.
    pub retry_count: u32,
    /// Fixed backoff in milliseconds; 0 selects exponential backoff.
    pub retry_delay_ms: u64,
    /// Overall retry budget per cycle in milliseconds; 0 is unlimited.
    pub retry_timeout_ms: u64,
    /// Total transfer timeout in milliseconds; 0 disables.
    pub timeout_ms: u64,
    /// Connect timeout in milliseconds; 0 disables.
    pub connect_timeout_ms: u64,
    /// Prefer pipelined/keepalive connection reuse.
    pub enable_http_pipelining: bool,
    /// Response body cap in bytes.
    pub maximum_response_size: usize,
    /// Smallest acceptable body, must cover the magic prefix.
    pub minimum_response_size: usize,
    /// Accept-Encoding request header, when set.
    pub request_http_encoding: Option<HttpEncoding>,
    /// Reject responses whose file time drifts this many seconds from the
    /// request time; 0 disables the check.
    pub panic_threshold_secs: i64,
    /// Forward proxy URL, when set.
    pub http_proxy: Option<String>,
    /// Resolver cache lifetime hint in seconds.
    pub dns_cache_timeout_secs: u64,
}

/// Validated process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub service_name: String,
    pub vendor_name: String,
    pub monitor_name: String,
    pub event_queue_name: String,
    pub base_url: String,
    /// Numeric DACS service id; `None` publishes without permission locks.
    pub dacs_id: Option<i32>,
    pub sessions: Vec<SessionConfig>,
    pub resources: Vec<Resource>,
    pub knobs: Knobs,
}

/// On-disk document; every scalar knob is a string.
#[derive(Debug, Serialize, Deserialize)]
struct RawConfig {
    service_name: String,
    vendor_name: String,
    monitor_name: String,
    event_queue_name: String,
    base_url: String,
    #[serde(default)]
    dacs_id: String,
    interval: String,
    time_offset_constant: String,
    #[serde(default)]
    tolerable_delay: String,
    #[serde(default)]
    retry_count: String,
    #[serde(default)]
    retry_delay_ms: String,
    #[serde(default)]
    retry_timeout_ms: String,
    #[serde(default)]
    timeout_ms: String,
    #[serde(default)]
    connect_timeout_ms: String,
    #[serde(default)]
    enable_http_pipelining: String,
    maximum_response_size: String,
    #[serde(default)]
    minimum_response_size: String,
    #[serde(default)]
    request_http_encoding: String,
    #[serde(default)]
    panic_threshold: String,
    #[serde(default)]
    http_proxy: String,
    #[serde(default)]
    dns_cache_timeout: String,
    sessions: Vec<SessionConfig>,
    resources: Vec<RawResource>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawResource {
    name: String,
    source: String,
    path: String,
    entitlement_code: u32,
    fields: HashMap<String, i32>,
    items: HashMap<String, ItemMapping>,
}

fn parse_knob<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::BadKnob {
        name,
        value: value.to_string(),
    })
}

/// Empty string means "use the default"; anything else must parse.
fn parse_knob_or<T: FromStr>(name: &'static str, value: &str, default: T) -> Result<T, ConfigError> {
    if value.trim().is_empty() {
        Ok(default)
    } else {
        parse_knob(name, value)
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl Config {
    /// Load and validate a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a YAML configuration document.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(content)?;
        raw.into_config()
    }
}

impl RawConfig {
    fn into_config(self) -> Result<Config, ConfigError> {
        let knobs = Knobs {
            interval_secs: parse_knob("interval", &self.interval)?,
            time_offset_constant: NaiveTime::parse_from_str(
                self.time_offset_constant.trim(),
                "%H:%M:%S",
            )
            .map_err(|_| ConfigError::BadKnob {
                name: "time_offset_constant",
                value: self.time_offset_constant.clone(),
            })?,
            tolerable_delay_ms: parse_knob_or("tolerable_delay", &self.tolerable_delay, 0)?,
            retry_count: parse_knob_or("retry_count", &self.retry_count, 0)?,
            retry_delay_ms: parse_knob_or("retry_delay_ms", &self.retry_delay_ms, 0)?,
            retry_timeout_ms: parse_knob_or("retry_timeout_ms", &self.retry_timeout_ms, 0)?,
            timeout_ms: parse_knob_or("timeout_ms", &self.timeout_ms, 0)?,
            connect_timeout_ms: parse_knob_or("connect_timeout_ms", &self.connect_timeout_ms, 0)?,
            enable_http_pipelining: parse_knob_or::<u8>(
                "enable_http_pipelining",
                &self.enable_http_pipelining,
                0,
            )? != 0,
            maximum_response_size: parse_knob("maximum_response_size", &self.maximum_response_size)?,
            minimum_response_size: parse_knob_or(
                "minimum_response_size",
                &self.minimum_response_size,
                4,
            )?,
            request_http_encoding: match self.request_http_encoding.trim() {
                "" => None,
                "identity" => Some(HttpEncoding::Identity),
                "deflate" => Some(HttpEncoding::Deflate),
                "gzip" => Some(HttpEncoding::Gzip),
                other => {
                    return Err(ConfigError::BadKnob {
                        name: "request_http_encoding",
                        value: other.to_string(),
                    })
                }
            },
            panic_threshold_secs: parse_knob_or("panic_threshold", &self.panic_threshold, 0)?,
            http_proxy: non_empty(&self.http_proxy),
            dns_cache_timeout_secs: parse_knob_or("dns_cache_timeout", &self.dns_cache_timeout, 60)?,
        };

        let dacs_id = match non_empty(&self.dacs_id) {
            Some(value) => Some(parse_knob("dacs_id", &value)?),
            None => None,
        };

        let resources = self
            .resources
            .into_iter()
            .map(|raw| Resource {
                url: format!("{}{}", self.base_url, raw.path),
                name: raw.name,
                source: raw.source,
                path: raw.path,
                entitlement_code: raw.entitlement_code,
                fields: raw.fields,
                items: raw.items,
            })
            .collect();

        let config = Config {
            service_name: self.service_name,
            vendor_name: self.vendor_name,
            monitor_name: self.monitor_name,
            event_queue_name: self.event_queue_name,
            base_url: self.base_url,
            dacs_id,
            sessions: self.sessions,
            resources,
            knobs,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        fn required(what: &str, value: &str) -> Result<(), ConfigError> {
            if value.trim().is_empty() {
                Err(ConfigError::Validation(format!("undefined {what}")))
            } else {
                Ok(())
            }
        }

        required("service name", &self.service_name)?;
        required("vendor name", &self.vendor_name)?;
        required("monitor name", &self.monitor_name)?;
        required("event queue name", &self.event_queue_name)?;
        required("base URL", &self.base_url)?;

        if self.sessions.is_empty() {
            return Err(ConfigError::Validation(
                "undefined session, expecting one or more".to_string(),
            ));
        }
        for session in &self.sessions {
            required("session name", &session.session_name)?;
            let name = &session.session_name;
            required(&format!("connection name for session \"{name}\""), &session.connection_name)?;
            required(&format!("publisher name for session \"{name}\""), &session.publisher_name)?;
            required(&format!("application id for session \"{name}\""), &session.application_id)?;
            required(&format!("instance id for session \"{name}\""), &session.instance_id)?;
            required(&format!("user name for session \"{name}\""), &session.user_name)?;
            if session.servers.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "undefined server list for session \"{name}\""
                )));
            }
        }

        if self.resources.is_empty() {
            return Err(ConfigError::Validation(
                "undefined resource, expecting one or more".to_string(),
            ));
        }
        for resource in &self.resources {
            let name = &resource.name;
            required("resource name", name)?;
            if resource.fields.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "resource \"{name}\" has no field mappings"
                )));
            }
            if resource.items.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "resource \"{name}\" has no item mappings"
                )));
            }
            if let Some(fid) = resource.duplicate_field_id() {
                return Err(ConfigError::Validation(format!(
                    "resource \"{name}\" maps field id {fid} more than once"
                )));
            }
        }

        if self.knobs.interval_secs == 0 {
            return Err(ConfigError::Validation("interval must be positive".to_string()));
        }
        if self.knobs.minimum_response_size < 4 {
            return Err(ConfigError::Validation(
                "minimum_response_size must cover the 4-byte magic".to_string(),
            ));
        }
        if self.knobs.minimum_response_size > self.knobs.maximum_response_size {
            return Err(ConfigError::Validation(
                "minimum_response_size exceeds maximum_response_size".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
service_name: NI_PSYCH
vendor_name: ThematicNetworks
monitor_name: ApplicationLoggerMonitorName
event_queue_name: event_queue
base_url: "http://psych.example.com"
dacs_id: "2326"
interval: "60"
time_offset_constant: "00:01:00"
retry_count: "3"
retry_delay_ms: "0"
retry_timeout_ms: "50000"
timeout_ms: "30000"
connect_timeout_ms: "10000"
maximum_response_size: "65536"
minimum_response_size: "128"
request_http_encoding: "gzip"
panic_threshold: "86400"
sessions:
  - session_name: SESSIONA
    connection_name: CONNECTIONA
    publisher_name: PUBLISHERA
    servers: ["adh1.example.com"]
    default_port: "14003"
    application_id: "256"
    instance_id: "Instance1"
    user_name: user1
    position: "127.0.0.1/net"
resources:
  - name: equities
    source: MarketPsych
    path: "/MP.n1"
    entitlement_code: 29
    fields:
      Buzz: 7001
      Sentiment: 7002
    items:
      "1679":
        ric: MP1679.MP
        topic: "psych/equities/1679"
"#;

    #[test]
    fn test_load_sample() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.service_name, "NI_PSYCH");
        assert_eq!(config.dacs_id, Some(2326));
        assert_eq!(config.knobs.interval_secs, 60);
        assert_eq!(config.knobs.retry_count, 3);
        assert_eq!(config.knobs.request_http_encoding, Some(HttpEncoding::Gzip));
        assert_eq!(config.resources.len(), 1);
        assert_eq!(config.resources[0].url, "http://psych.example.com/MP.n1");
        assert_eq!(config.resources[0].items["1679"].ric, "MP1679.MP");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.sessions.len(), 1);
        assert_eq!(config.sessions[0].session_name, "SESSIONA");
    }

    #[test]
    fn test_empty_dacs_id_disables_locks() {
        let doc = SAMPLE.replace("dacs_id: \"2326\"", "dacs_id: \"\"");
        let config = Config::from_yaml(&doc).unwrap();
        assert_eq!(config.dacs_id, None);
    }

    #[test]
    fn test_bad_interval_rejected() {
        let doc = SAMPLE.replace("interval: \"60\"", "interval: \"sixty\"");
        let err = Config::from_yaml(&doc).unwrap_err();
        assert!(matches!(err, ConfigError::BadKnob { name: "interval", .. }));
    }

    #[test]
    fn test_bad_time_offset_rejected() {
        let doc = SAMPLE.replace("\"00:01:00\"", "\"25:00\"");
        let err = Config::from_yaml(&doc).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::BadKnob { name: "time_offset_constant", .. }
        ));
    }

    #[test]
    fn test_duplicate_field_id_rejected() {
        let doc = SAMPLE.replace("Sentiment: 7002", "Sentiment: 7001");
        let err = Config::from_yaml(&doc).unwrap_err();
        assert!(err.to_string().contains("7001"));
    }

    #[test]
    fn test_missing_session_user_rejected() {
        let doc = SAMPLE.replace("user_name: user1", "user_name: \"\"");
        assert!(Config::from_yaml(&doc).is_err());
    }

    #[test]
    fn test_minimum_response_size_default() {
        let doc = SAMPLE.replace("minimum_response_size: \"128\"", "");
        let config = Config::from_yaml(&doc).unwrap();
        assert_eq!(config.knobs.minimum_response_size, 4);
    }
}
