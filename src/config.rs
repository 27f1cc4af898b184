//! Configuration types
//!
//! The sink and the source connector share one configuration substrate: a
//! YAML document (with `${VAR}` / `${VAR:-default}` environment expansion)
//! or, for drop-in compatibility with property-file deployments, a flat
//! `neo4j.*` key map. Validation happens once at start-up; everything the
//! pipeline holds afterwards is immutable.

use crate::engine::EngineConfig;
use crate::error::{ConnectError, Result};
use crate::handlers::{CypherBindings, SourceIdConfig, Strategy};
use crate::pattern::{NodePattern, RelationshipPattern};
use crate::source::SourceConnectorConfig;
use crate::types::SensitiveString;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

/// Connector id accepted in `connector.class`
pub const SINK_CONNECTOR_CLASS: &str = "Neo4jSinkConnector";

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ConnectConfig {
    /// Configuration version
    #[serde(default = "default_version")]
    pub version: String,

    /// Graph database connection
    pub neo4j: Neo4jConfig,

    /// Sink connector (topics -> graph)
    #[serde(default)]
    pub sink: Option<SinkConnectorConfig>,

    /// Source connector (graph -> topic)
    #[serde(default)]
    pub source: Option<SourceConnectorConfig>,

    /// Runtime settings
    #[serde(default)]
    pub settings: GlobalSettings,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Graph database connection configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct Neo4jConfig {
    /// Bolt URI, e.g. `neo4j://localhost:7687`
    pub uri: String,

    /// Basic-auth user
    #[serde(default = "default_username")]
    pub username: String,

    /// Basic-auth password
    pub password: SensitiveString,

    /// Database name (server default when absent)
    #[serde(default)]
    pub database: Option<String>,
}

fn default_username() -> String {
    "neo4j".to_string()
}

/// Sink connector configuration
///
/// Every topic must be claimed by exactly one strategy.
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct SinkConnectorConfig {
    /// Topic -> statement template
    #[serde(default)]
    pub cypher: HashMap<String, String>,

    /// Bindings visible to statement templates
    #[serde(default)]
    pub cypher_bindings: CypherBindings,

    /// Topics carrying CUD records
    #[serde(default)]
    pub cud: Vec<String>,

    /// Topic -> node pattern
    #[serde(default)]
    pub node_patterns: HashMap<String, String>,

    /// Topic -> relationship pattern
    #[serde(default)]
    pub relationship_patterns: HashMap<String, String>,

    /// Merge pattern-projected properties instead of replacing them
    #[serde(default)]
    pub pattern_merge_properties: bool,

    /// Topics carrying constraint-bearing change events
    #[serde(default)]
    pub cdc_schema: Vec<String>,

    /// Topics carrying source-id change events
    #[serde(default)]
    pub cdc_source_id: Vec<String>,

    /// Naming for the source-id strategy
    #[serde(default)]
    pub cdc_source_id_naming: SourceIdConfig,

    /// Maximum parameter entries per statement invocation
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 100_000))]
    pub batch_size: usize,

    /// How long a poll waits for records before returning a partial batch
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    /// Retry attempts for transient driver failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff between retries
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// What happens to records the pipeline refuses
    #[serde(default)]
    pub errors: ErrorsConfig,
}

fn default_batch_size() -> usize {
    1000
}

fn default_batch_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    300
}

impl Default for SinkConnectorConfig {
    fn default() -> Self {
        Self {
            cypher: HashMap::new(),
            cypher_bindings: CypherBindings::default(),
            cud: Vec::new(),
            node_patterns: HashMap::new(),
            relationship_patterns: HashMap::new(),
            pattern_merge_properties: false,
            cdc_schema: Vec::new(),
            cdc_source_id: Vec::new(),
            cdc_source_id_naming: SourceIdConfig::default(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            errors: ErrorsConfig::default(),
        }
    }
}

/// Error tolerance of the pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ErrorTolerance {
    /// Any refused record fails the connector
    #[default]
    None,
    /// Refused records are skipped (or dead-lettered when configured)
    All,
}

/// Error routing configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct ErrorsConfig {
    /// Tolerance level
    #[serde(default)]
    pub tolerance: ErrorTolerance,

    /// Topic receiving refused records
    #[serde(default)]
    pub dead_letter_topic: Option<String>,
}

/// Resolved error routing policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Fail the connector
    Fail,
    /// Log and drop the record
    Skip,
    /// Publish the record to the named topic
    DeadLetter(String),
}

impl ErrorsConfig {
    /// Resolve the configured policy
    pub fn policy(&self) -> ErrorPolicy {
        match (self.tolerance, &self.dead_letter_topic) {
            (ErrorTolerance::None, _) => ErrorPolicy::Fail,
            (ErrorTolerance::All, Some(topic)) => ErrorPolicy::DeadLetter(topic.clone()),
            (ErrorTolerance::All, None) => ErrorPolicy::Skip,
        }
    }
}

/// Runtime settings
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct GlobalSettings {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Maximum records fetched per poll
    #[serde(default = "default_poll_max_records")]
    pub poll_max_records: usize,

    /// Grace period an in-flight batch gets during shutdown
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            poll_max_records: default_poll_max_records(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_max_records() -> usize {
    500
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

impl ConnectConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = Self::expand_env_vars(&content);
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());
                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate the whole document
    pub fn validate(&self) -> Result<()> {
        if self.neo4j.uri.is_empty() {
            return Err(ConnectError::config("neo4j.uri must not be empty"));
        }
        if let Some(sink) = &self.sink {
            sink.validate_assignments()?;
        }
        if let Some(source) = &self.source {
            source.validate_config()?;
        }
        Ok(())
    }
}

impl SinkConnectorConfig {
    /// Build the sink config from a flat property map.
    ///
    /// Accepts the conventional `neo4j.*` key set:
    ///
    /// ```text
    /// neo4j.topic.cypher.<topic>              statement template
    /// neo4j.topic.cud                         comma-separated topics
    /// neo4j.topic.pattern.node.<topic>        node pattern
    /// neo4j.topic.pattern.relationship.<topic> relationship pattern
    /// neo4j.topic.pattern.merge.properties    bool
    /// neo4j.topic.cdc.schema                  comma-separated topics
    /// neo4j.topic.cdc.sourceId                comma-separated topics
    /// neo4j.topic.cdc.sourceId.labelName      label for mirrored nodes
    /// neo4j.topic.cdc.sourceId.idName         identifier property
    /// neo4j.batch.size / neo4j.batch.timeout.msecs
    /// neo4j.retry.max.attemps / neo4j.retry.backoff.msecs
    /// errors.tolerance / errors.deadletterqueue.topic.name
    /// ```
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self> {
        if let Some(class) = props.get("connector.class") {
            let class = class.rsplit('.').next().unwrap_or(class);
            if class != SINK_CONNECTOR_CLASS {
                return Err(ConnectError::config(format!(
                    "unsupported connector.class '{class}'"
                )));
            }
        }

        let mut config = Self::default();
        let comma_list = |value: &String| -> Vec<String> {
            value
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        };
        let parse_num = |key: &str, value: &String| -> Result<u64> {
            value
                .trim()
                .parse()
                .map_err(|_| ConnectError::config(format!("'{key}' is not a number: {value}")))
        };

        for (key, value) in props {
            match key.as_str() {
                "neo4j.topic.cud" => config.cud = comma_list(value),
                "neo4j.topic.cdc.schema" => config.cdc_schema = comma_list(value),
                "neo4j.topic.cdc.sourceId" => config.cdc_source_id = comma_list(value),
                "neo4j.topic.cdc.sourceId.labelName" => {
                    config.cdc_source_id_naming.label_name = value.clone();
                }
                "neo4j.topic.cdc.sourceId.idName" => {
                    config.cdc_source_id_naming.id_name = value.clone();
                }
                "neo4j.topic.pattern.merge.properties" => {
                    config.pattern_merge_properties = value.trim() == "true";
                }
                "neo4j.batch.size" => {
                    config.batch_size = parse_num(key, value)? as usize;
                }
                "neo4j.batch.timeout.msecs" => {
                    config.batch_timeout_ms = parse_num(key, value)?;
                }
                "neo4j.retry.max.attemps" => {
                    config.max_retries = parse_num(key, value)? as u32;
                }
                "neo4j.retry.backoff.msecs" => {
                    config.retry_backoff_ms = parse_num(key, value)?;
                }
                "errors.tolerance" => {
                    config.errors.tolerance = match value.trim() {
                        "none" => ErrorTolerance::None,
                        "all" => ErrorTolerance::All,
                        other => {
                            return Err(ConnectError::config(format!(
                                "unknown errors.tolerance '{other}'"
                            )))
                        }
                    };
                }
                "errors.deadletterqueue.topic.name" => {
                    config.errors.dead_letter_topic = Some(value.clone());
                }
                _ => {
                    if let Some(topic) = key.strip_prefix("neo4j.topic.cypher.") {
                        config.cypher.insert(topic.to_string(), value.clone());
                    } else if let Some(topic) = key.strip_prefix("neo4j.topic.pattern.node.") {
                        config.node_patterns.insert(topic.to_string(), value.clone());
                    } else if let Some(topic) =
                        key.strip_prefix("neo4j.topic.pattern.relationship.")
                    {
                        config
                            .relationship_patterns
                            .insert(topic.to_string(), value.clone());
                    }
                }
            }
        }

        config.validate_assignments()?;
        Ok(config)
    }

    /// Topic -> strategy assignments, failing on conflicts and bad patterns.
    ///
    /// Exactly one strategy per topic is permitted.
    pub fn strategies(&self) -> Result<BTreeMap<String, Strategy>> {
        let mut assignments: BTreeMap<String, Strategy> = BTreeMap::new();
        let mut claim = |topic: &str, strategy: Strategy| -> Result<()> {
            if let Some(existing) = assignments.get(topic) {
                return Err(ConnectError::config(format!(
                    "topic '{topic}' is assigned to both '{}' and '{}'",
                    existing.id(),
                    strategy.id()
                )));
            }
            assignments.insert(topic.to_string(), strategy);
            Ok(())
        };

        for (topic, statement) in &self.cypher {
            if statement.trim().is_empty() {
                return Err(ConnectError::config(format!(
                    "empty statement template for topic '{topic}'"
                )));
            }
            claim(
                topic,
                Strategy::Cypher {
                    statement: statement.clone(),
                    bindings: self.cypher_bindings.clone(),
                },
            )?;
        }
        for topic in &self.cud {
            claim(topic, Strategy::Cud)?;
        }
        for (topic, pattern) in &self.node_patterns {
            let parsed = NodePattern::parse(pattern, self.pattern_merge_properties)?;
            claim(topic, Strategy::NodePattern(parsed))?;
        }
        for (topic, pattern) in &self.relationship_patterns {
            let parsed = RelationshipPattern::parse(pattern, self.pattern_merge_properties)?;
            claim(topic, Strategy::RelationshipPattern(parsed))?;
        }
        for topic in &self.cdc_schema {
            claim(topic, Strategy::CdcSchema)?;
        }
        for topic in &self.cdc_source_id {
            claim(
                topic,
                Strategy::CdcSourceId(self.cdc_source_id_naming.clone()),
            )?;
        }

        if assignments.is_empty() {
            return Err(ConnectError::config("no topic is assigned to a strategy"));
        }
        Ok(assignments)
    }

    /// Validate assignments and numeric ranges
    pub fn validate_assignments(&self) -> Result<()> {
        self.validate()
            .map_err(|e| ConnectError::config(e.to_string()))?;
        self.strategies().map(|_| ())
    }

    /// Engine tunables derived from this config
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            batch_size: self.batch_size,
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("CONNECT_TEST_VAR", "hello");
        assert_eq!(
            ConnectConfig::expand_env_vars("value: ${CONNECT_TEST_VAR}"),
            "value: hello"
        );
        std::env::remove_var("CONNECT_TEST_MISSING");
        assert_eq!(
            ConnectConfig::expand_env_vars("value: ${CONNECT_TEST_MISSING:-fallback}"),
            "value: fallback"
        );
    }

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
version: "1.0"
neo4j:
  uri: neo4j://localhost:7687
  username: neo4j
  password: secret
sink:
  cypher:
    orders: "MERGE (o:Order {id: event.value.id})"
  cud: [mutations]
  cdc_schema: [graph.changes]
  errors:
    tolerance: all
    dead_letter_topic: dlq
"#;
        let config: ConnectConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        let sink = config.sink.unwrap();
        assert_eq!(sink.errors.policy(), ErrorPolicy::DeadLetter("dlq".into()));
        let strategies = sink.strategies().unwrap();
        assert_eq!(strategies.len(), 3);
        assert_eq!(strategies.get("mutations").unwrap().id(), "cud");
    }

    #[test]
    fn test_from_properties() {
        let config = SinkConnectorConfig::from_properties(&props(&[
            ("connector.class", "Neo4jSinkConnector"),
            ("neo4j.topic.cypher.orders", "MERGE (o:Order {id: event.value.id})"),
            ("neo4j.topic.cud", "cud-a, cud-b"),
            ("neo4j.topic.pattern.node.users", "(:User{!id,*})"),
            (
                "neo4j.topic.pattern.relationship.bought",
                "(:User{!id})-[:BOUGHT]->(:Product{!sku})",
            ),
            ("neo4j.topic.cdc.schema", "changes"),
            ("neo4j.topic.cdc.sourceId", "mirror"),
            ("neo4j.topic.cdc.sourceId.labelName", "Mirror"),
            ("neo4j.batch.size", "250"),
            ("neo4j.retry.max.attemps", "7"),
            ("errors.tolerance", "all"),
        ]))
        .unwrap();

        assert_eq!(config.cud, vec!["cud-a", "cud-b"]);
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.cdc_source_id_naming.label_name, "Mirror");
        assert_eq!(config.strategies().unwrap().len(), 7);
    }

    #[test]
    fn test_conflicting_assignment_rejected() {
        let err = SinkConnectorConfig::from_properties(&props(&[
            ("neo4j.topic.cud", "orders"),
            ("neo4j.topic.cdc.schema", "orders"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("orders"));
    }

    #[test]
    fn test_invalid_pattern_rejected_at_startup() {
        let err = SinkConnectorConfig::from_properties(&props(&[(
            "neo4j.topic.pattern.node.users",
            "(:User{id})",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("at least one key"));
    }

    #[test]
    fn test_unknown_connector_class_rejected() {
        let err = SinkConnectorConfig::from_properties(&props(&[(
            "connector.class",
            "JdbcSinkConnector",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("connector.class"));
    }

    #[test]
    fn test_no_assignment_rejected() {
        let err = SinkConnectorConfig::default().validate_assignments().unwrap_err();
        assert!(err.to_string().contains("no topic"));
    }

    #[test]
    fn test_error_policy_resolution() {
        let mut errors = ErrorsConfig::default();
        assert_eq!(errors.policy(), ErrorPolicy::Fail);

        errors.tolerance = ErrorTolerance::All;
        assert_eq!(errors.policy(), ErrorPolicy::Skip);

        errors.dead_letter_topic = Some("dlq".into());
        assert_eq!(errors.policy(), ErrorPolicy::DeadLetter("dlq".into()));
    }
}
