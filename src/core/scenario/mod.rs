//! Validated configuration model: scenarios, gateways, entry points,
//! switch instances.
//!
//! The relational rows carry loosely-typed JSON columns; everything is
//! parsed into explicit structs here, at load time. A malformed row is a
//! `ConfigError`; required fields are never silently defaulted.

pub mod source;

pub use source::{ScenarioSource, StaticScenarioSource};

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Raised when a configuration row cannot be validated at load time.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("{entity} {id}: missing required field {field}")]
    MissingField {
        entity: &'static str,
        id: String,
        field: &'static str,
    },
    #[error("{entity} {id}: {reason}")]
    Invalid {
        entity: &'static str,
        id: String,
        reason: String,
    },
}

fn require(
    entity: &'static str,
    id: &str,
    field: &'static str,
    value: &str,
) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::MissingField {
            entity,
            id: id.to_string(),
            field,
        });
    }
    Ok(trimmed.to_string())
}

/// Raw `scenarios` row, JSON columns still untyped.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioRecord {
    pub scenario_id: String,
    pub name: String,
    #[serde(default)]
    pub entry_points: Vec<String>,
    pub system_prompt: String,
    pub welcome_message: String,
    pub fallback_responses: Vec<String>,
    pub max_turns: u32,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub custom_settings: serde_json::Value,
}

/// A conversation scenario, immutable once bound to a session.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioConfig {
    pub scenario_id: String,
    pub name: String,
    pub entry_points: Vec<String>,
    pub system_prompt: String,
    pub welcome_message: String,
    /// Ordered, non-empty; selected deterministically on backend failure.
    pub fallback_responses: Vec<String>,
    pub max_turns: u32,
    pub timeout: Duration,
    pub custom_settings: serde_json::Value,
}

impl TryFrom<ScenarioRecord> for ScenarioConfig {
    type Error = ConfigError;

    fn try_from(record: ScenarioRecord) -> Result<Self, ConfigError> {
        let id = record.scenario_id.clone();
        let system_prompt = require("scenario", &id, "system_prompt", &record.system_prompt)?;
        let welcome_message =
            require("scenario", &id, "welcome_message", &record.welcome_message)?;

        if record.fallback_responses.is_empty() {
            return Err(ConfigError::Invalid {
                entity: "scenario",
                id,
                reason: "fallback_responses must not be empty".to_string(),
            });
        }
        if record.max_turns == 0 {
            return Err(ConfigError::Invalid {
                entity: "scenario",
                id,
                reason: "max_turns must be positive".to_string(),
            });
        }
        if record.timeout_seconds == 0 {
            return Err(ConfigError::Invalid {
                entity: "scenario",
                id,
                reason: "timeout_seconds must be positive".to_string(),
            });
        }

        Ok(Self {
            scenario_id: require("scenario", &id, "scenario_id", &record.scenario_id)?,
            name: record.name,
            entry_points: record.entry_points,
            system_prompt,
            welcome_message,
            fallback_responses: record.fallback_responses,
            max_turns: record.max_turns,
            timeout: Duration::from_secs(record.timeout_seconds),
            custom_settings: record.custom_settings,
        })
    }
}

impl ScenarioConfig {
    /// Deterministic fallback selection: the N-th failure in a turn plays
    /// index `N mod len`.
    pub fn fallback_for(&self, error_count: u32) -> &str {
        let idx = (error_count as usize) % self.fallback_responses.len();
        &self.fallback_responses[idx]
    }
}

/// Raw `gateways` row.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayRecord {
    pub gateway_id: String,
    pub gateway_type: String,
    pub profile: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub realm: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    pub codecs: Vec<String>,
    pub max_channels: u32,
}

/// Dial-out gateway, read-only reference for the outbound scheduler.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub gateway_id: String,
    pub gateway_type: String,
    pub profile: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub realm: Option<String>,
    pub proxy: Option<String>,
    pub codecs: Vec<String>,
    pub max_channels: u32,
}

impl TryFrom<GatewayRecord> for GatewayConfig {
    type Error = ConfigError;

    fn try_from(record: GatewayRecord) -> Result<Self, ConfigError> {
        let id = record.gateway_id.clone();
        if record.codecs.is_empty() {
            return Err(ConfigError::Invalid {
                entity: "gateway",
                id,
                reason: "codec list must not be empty".to_string(),
            });
        }
        if record.max_channels == 0 {
            return Err(ConfigError::Invalid {
                entity: "gateway",
                id,
                reason: "max_channels must be positive".to_string(),
            });
        }
        Ok(Self {
            gateway_id: require("gateway", &id, "gateway_id", &record.gateway_id)?,
            gateway_type: require("gateway", &id, "gateway_type", &record.gateway_type)?,
            profile: require("gateway", &id, "profile", &record.profile)?,
            username: record.username,
            password: record.password,
            realm: record.realm,
            proxy: record.proxy,
            codecs: record.codecs,
            max_channels: record.max_channels,
        })
    }
}

impl GatewayConfig {
    /// Dial string for originating through this gateway.
    pub fn dial_string(&self, destination: &str, variables: &[(String, String)]) -> String {
        let mut vars = String::new();
        if !variables.is_empty() {
            let joined: Vec<String> = variables
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            vars = format!("{{{}}}", joined.join(","));
        }
        format!("{vars}sofia/gateway/{}/{destination}", self.gateway_id)
    }
}

/// Dialplan entry point mapping an inbound pattern to a scenario.
#[derive(Debug, Clone, Deserialize)]
pub struct EntryPoint {
    pub entry_point_id: String,
    pub dialplan_pattern: String,
    pub scenario_id: String,
    #[serde(default)]
    pub gateway_id: Option<String>,
    pub priority: i32,
}

impl EntryPoint {
    pub fn validate(self) -> Result<Self, ConfigError> {
        require(
            "entry_point",
            &self.entry_point_id,
            "dialplan_pattern",
            &self.dialplan_pattern,
        )?;
        require(
            "entry_point",
            &self.entry_point_id,
            "scenario_id",
            &self.scenario_id,
        )?;
        Ok(self)
    }

    /// Whether the dialed destination matches this entry point. Patterns
    /// are anchored literal strings with `^...$` trimmed, the way rows
    /// store them.
    pub fn matches(&self, destination: &str) -> bool {
        let pattern = self
            .dialplan_pattern
            .trim_start_matches('^')
            .trim_end_matches('$');
        pattern == destination
    }
}

/// Switch instance row: where to reach the event socket, plus the
/// entry-point → scenario mapping active on that instance.
#[derive(Debug, Clone, Deserialize)]
pub struct SwitchInstanceConfig {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub password: String,
    #[serde(default)]
    pub scenario_mapping: HashMap<String, String>,
    #[serde(default)]
    pub gateway_ids: Vec<String>,
}

impl SwitchInstanceConfig {
    pub fn validate(self) -> Result<Self, ConfigError> {
        require("switch_instance", &self.instance_id, "host", &self.host)?;
        require(
            "switch_instance",
            &self.instance_id,
            "password",
            &self.password,
        )?;
        if self.port == 0 {
            return Err(ConfigError::Invalid {
                entity: "switch_instance",
                id: self.instance_id,
                reason: "port must be positive".to_string(),
            });
        }
        Ok(self)
    }
}
