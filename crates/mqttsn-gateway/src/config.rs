// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gateway configuration.
//!
//! Loaded from a TOML file or built programmatically. Every field has a
//! default so a minimal file only needs to name the broker.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::broker;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway id advertised to devices (ADVERTISE, GWINFO).
    #[serde(default = "default_gw_id")]
    pub gw_id: u8,

    /// Ids `1..=predefined_topic_id_size` are reserved for predefined topics.
    #[serde(default = "default_predefined_size")]
    pub predefined_topic_id_size: u16,

    /// ADVERTISE interval (seconds).
    #[serde(default = "default_adv_period")]
    pub adv_period_secs: u64,

    /// Gateway PINGREQ interval toward the broker (seconds).
    #[serde(default = "default_keep_alive_period")]
    pub keep_alive_period_secs: u64,

    /// Inactivity sweep interval (seconds).
    #[serde(default = "default_checking_period")]
    pub checking_period_secs: u64,

    /// Retransmissions before a handshake is abandoned.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Time to wait for a handshake reply (seconds).
    #[serde(default = "default_waiting_time")]
    pub waiting_time_secs: u64,

    /// Idle time after which a device session is evicted (seconds).
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: u64,

    /// Idle time after which a forwarder is forgotten (seconds).
    #[serde(default = "default_forwarder_timeout")]
    pub forwarder_timeout_secs: u64,

    #[serde(default = "default_min_frame_length")]
    pub min_frame_length: usize,

    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Predefined topics shared by every session.
    #[serde(default)]
    pub predefined_topics: Vec<PredefinedTopic>,

    #[serde(default)]
    pub broker: BrokerConfig,

    /// Defaults applied to every broker CONNECT.
    #[serde(default)]
    pub connect: ConnectConfig,

    /// Device-facing links opened once the gateway is connected.
    #[serde(default = "default_device_links")]
    pub device_links: Vec<DeviceLinkConfig>,
}

fn default_gw_id() -> u8 {
    1
}

fn default_predefined_size() -> u16 {
    50
}

fn default_adv_period() -> u64 {
    900
}

fn default_keep_alive_period() -> u64 {
    60
}

fn default_checking_period() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_waiting_time() -> u64 {
    10
}

fn default_handler_timeout() -> u64 {
    1800
}

fn default_forwarder_timeout() -> u64 {
    3600
}

fn default_min_frame_length() -> usize {
    2
}

fn default_max_frame_length() -> usize {
    255
}

fn default_device_links() -> Vec<DeviceLinkConfig> {
    vec![DeviceLinkConfig::Udp {
        port: default_udp_port(),
    }]
}

fn default_udp_port() -> u16 {
    20000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gw_id: default_gw_id(),
            predefined_topic_id_size: default_predefined_size(),
            predefined_topics: Vec::new(),
            adv_period_secs: default_adv_period(),
            keep_alive_period_secs: default_keep_alive_period(),
            checking_period_secs: default_checking_period(),
            max_retries: default_max_retries(),
            waiting_time_secs: default_waiting_time(),
            handler_timeout_secs: default_handler_timeout(),
            forwarder_timeout_secs: default_forwarder_timeout(),
            min_frame_length: default_min_frame_length(),
            max_frame_length: default_max_frame_length(),
            broker: BrokerConfig::default(),
            connect: ConnectConfig::default(),
            device_links: default_device_links(),
            log_level: default_log_level(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("adv_period_secs", self.adv_period_secs),
            ("keep_alive_period_secs", self.keep_alive_period_secs),
            ("checking_period_secs", self.checking_period_secs),
            ("waiting_time_secs", self.waiting_time_secs),
            ("forwarder_timeout_secs", self.forwarder_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be > 0", name)));
            }
        }

        if self.min_frame_length < 2
            || self.max_frame_length > 255
            || self.min_frame_length > self.max_frame_length
        {
            return Err(ConfigError::Invalid(format!(
                "frame length range {}..={} must lie within 2..=255",
                self.min_frame_length, self.max_frame_length
            )));
        }

        let mut seen = HashSet::new();
        for topic in &self.predefined_topics {
            if topic.id == 0 || topic.id > self.predefined_topic_id_size {
                return Err(ConfigError::Invalid(format!(
                    "predefined topic '{}' has id {} outside 1..={}",
                    topic.name, topic.id, self.predefined_topic_id_size
                )));
            }
            if !seen.insert(topic.id) {
                return Err(ConfigError::Invalid(format!(
                    "predefined topic id {} is defined twice",
                    topic.id
                )));
            }
            if topic.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "predefined topic id {} has an empty name",
                    topic.id
                )));
            }
        }

        if self.connect.will_qos > 2 {
            return Err(ConfigError::Invalid(format!(
                "will_qos {} must be 0, 1 or 2",
                self.connect.will_qos
            )));
        }

        if self.broker.host.is_empty() {
            return Err(ConfigError::Invalid("broker host is empty".into()));
        }

        if self.device_links.is_empty() {
            return Err(ConfigError::Invalid("no device links configured".into()));
        }

        Ok(())
    }

    pub fn waiting_time(&self) -> Duration {
        Duration::from_secs(self.waiting_time_secs)
    }

    pub fn keep_alive_period(&self) -> Duration {
        Duration::from_secs(self.keep_alive_period_secs)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn forwarder_timeout(&self) -> Duration {
        Duration::from_secs(self.forwarder_timeout_secs)
    }

    /// Predefined topics as (id, name) pairs.
    pub fn predefined_entries(&self) -> impl Iterator<Item = (u16, String)> + '_ {
        self.predefined_topics
            .iter()
            .map(|t| (t.id, t.name.clone()))
    }
}

/// One predefined topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredefinedTopic {
    pub id: u16,
    pub name: String,
}

/// Broker endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
        }
    }
}

/// Broker CONNECT defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    #[serde(default = "default_protocol_name")]
    pub protocol_name: String,

    #[serde(default = "default_protocol_version")]
    pub protocol_version: u8,

    #[serde(default = "default_true")]
    pub clean_session: bool,

    #[serde(default)]
    pub will_flag: bool,

    #[serde(default)]
    pub will_qos: u8,

    #[serde(default)]
    pub will_retain: bool,

    #[serde(default)]
    pub will_topic: String,

    #[serde(default)]
    pub will_message: String,
}

fn default_protocol_name() -> String {
    broker::PROTOCOL_NAME.to_string()
}

fn default_protocol_version() -> u8 {
    broker::PROTOCOL_VERSION
}

fn default_true() -> bool {
    true
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            protocol_name: default_protocol_name(),
            protocol_version: default_protocol_version(),
            clean_session: true,
            will_flag: false,
            will_qos: 0,
            will_retain: false,
            will_topic: String::new(),
            will_message: String::new(),
        }
    }
}

impl ConnectConfig {
    /// Will carried by the gateway's own CONNECT, if enabled.
    pub fn will(&self) -> Option<broker::Will> {
        self.will_flag.then(|| broker::Will {
            topic: self.will_topic.clone(),
            message: self.will_message.clone().into_bytes(),
            qos: self.will_qos,
            retain: self.will_retain,
        })
    }
}

/// Device-facing link kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DeviceLinkConfig {
    /// UDP datagram link.
    Udp {
        #[serde(default = "default_udp_port")]
        port: u16,
    },
}

impl DeviceLinkConfig {
    pub fn name(&self) -> String {
        match self {
            Self::Udp { port } => format!("udp:{}", port),
        }
    }
}
