//! Logic for loading configuration in to an object model
mod data_source;

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

pub use data_source::ArgumentConfiguration;
pub use data_source::ArgumentSource;
pub use data_source::DataSourceConfiguration;
pub use data_source::DataSourceKind;
pub use data_source::FederationFieldConfiguration;
pub use data_source::FederationMetaData;
pub use data_source::FieldConfiguration;
pub use data_source::FieldConfigurations;
pub use data_source::TypeField;
use schemars::JsonSchema;
use schemars::schema::RootSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigurationError;
use crate::protocols::WebSocketProtocol;

const DEFAULT_PLAN_CACHE_CAPACITY: usize = 1024;
const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_READ_ERROR_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_EXECUTION_TRIES: u32 = 5;
const DEFAULT_INITIAL_RETRY_WAIT: Duration = Duration::from_secs(1);
const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// The configuration for the engine.
///
/// Can be created through `serde::Deserialize` from various formats, or with
/// [`Configuration::from_yaml`].
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Configuration {
    /// Query and mutation execution.
    pub engine: Engine,

    /// Subscription execution.
    pub subscription: Subscription,

    /// WebSocket protocols.
    pub websocket: WebSocket,

    /// Upstream data sources, in priority order: when several data sources resolve the same
    /// root field, the first one wins.
    pub data_sources: Vec<DataSourceConfiguration>,

    /// Per field planning configuration.
    pub field_configurations: Vec<FieldConfiguration>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Engine {
    /// Maximum number of plans kept in the plan cache; defaults to 1024
    pub plan_cache_capacity: usize,

    /// Request headers whose values are part of the plan cache key.
    pub fingerprint_headers: Vec<String>,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            plan_cache_capacity: DEFAULT_PLAN_CACHE_CAPACITY,
            fingerprint_headers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Subscription {
    /// Time between two executions of a subscription; defaults to 1s
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub update_interval: Duration,

    /// Time after a failed read before the connection is closed, unless a read succeeds in the
    /// meantime; defaults to 5s
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub read_error_timeout: Duration,

    /// Attempts of a single execution before the subscription gives up; defaults to 5
    pub max_execution_tries: u32,

    /// Wait before the first retry, doubled after each failure; defaults to 1s
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub initial_retry_wait: Duration,
}

impl Default for Subscription {
    fn default() -> Self {
        Self {
            update_interval: DEFAULT_UPDATE_INTERVAL,
            read_error_timeout: DEFAULT_READ_ERROR_TIMEOUT,
            max_execution_tries: DEFAULT_MAX_EXECUTION_TRIES,
            initial_retry_wait: DEFAULT_INITIAL_RETRY_WAIT,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct WebSocket {
    /// Time a client has to send `connection_init`; defaults to 15s
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub init_timeout: Duration,

    /// Interval of keep-alive and heartbeat messages; defaults to 15s
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub keep_alive_interval: Duration,

    /// Protocol used when the client does not ask for one.
    pub default_protocol: WebSocketProtocol,
}

impl Default for WebSocket {
    fn default() -> Self {
        Self {
            init_timeout: DEFAULT_INIT_TIMEOUT,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            default_protocol: WebSocketProtocol::default(),
        }
    }
}

impl Configuration {
    /// Parses and validates a YAML configuration.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigurationError> {
        let configuration: Configuration = serde_yaml::from_str(yaml)
            .map_err(|e| ConfigurationError::Deserialization(e.to_string()))?;
        configuration.validate()?;
        Ok(configuration)
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let configuration: Configuration = serde_json::from_str(json)
            .map_err(|e| ConfigurationError::Deserialization(e.to_string()))?;
        configuration.validate()?;
        Ok(configuration)
    }

    /// JSON schema of the configuration file.
    pub fn json_schema() -> RootSchema {
        schemars::schema_for!(Configuration)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigurationError> {
        if self.engine.plan_cache_capacity == 0 {
            return Err(ConfigurationError::InvalidPlanCacheCapacity);
        }

        let mut ids = HashSet::new();
        for data_source in &self.data_sources {
            if !ids.insert(data_source.id.as_str()) {
                return Err(ConfigurationError::DuplicateDataSource(
                    data_source.id.clone(),
                ));
            }
            let federation = &data_source.federation;
            if let Some(entry) = federation
                .keys
                .iter()
                .chain(federation.requires.iter())
                .find(|entry| entry.selection_set.trim().is_empty())
            {
                return Err(ConfigurationError::InvalidDataSource {
                    source_id: data_source.id.clone(),
                    reason: format!("empty selection set for type '{}'", entry.type_name),
                });
            }
            if let Some(entry) = federation.requires.iter().find(|e| e.field_name.is_none()) {
                return Err(ConfigurationError::InvalidDataSource {
                    source_id: data_source.id.clone(),
                    reason: format!("@requires on type '{}' must name a field", entry.type_name),
                });
            }
        }

        for field in &self.field_configurations {
            if field.parent_arguments().any(|(_, path)| path.is_empty()) {
                return Err(ConfigurationError::InvalidFieldConfiguration {
                    type_name: field.type_name.clone(),
                    field_name: field.field_name.clone(),
                    reason: "parent object arguments need a path".to_string(),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn field_configurations(&self) -> FieldConfigurations {
        self.field_configurations.iter().cloned().collect()
    }
}

impl FromStr for Configuration {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_yaml(s)
    }
}
