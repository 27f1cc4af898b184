//! Topic registry
//!
//! Maps each configured topic to its materialized handler. Built once at
//! start-up from the validated configuration and read-only afterwards, so
//! consumer tasks dispatch without synchronization.

use crate::config::SinkConnectorConfig;
use crate::error::Result;
use crate::handlers::SinkHandler;
use crate::metrics::PipelineMetrics;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Immutable topic -> handler map
pub struct TopicRegistry {
    handlers: HashMap<String, Arc<dyn SinkHandler>>,
}

impl TopicRegistry {
    /// Materialize one handler per configured topic
    pub fn from_config(
        config: &SinkConnectorConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self> {
        let mut handlers = HashMap::new();
        for (topic, strategy) in config.strategies()? {
            info!(topic = %topic, strategy = strategy.id(), "registering sink handler");
            handlers.insert(topic, strategy.into_handler(metrics.clone()));
        }
        Ok(Self { handlers })
    }

    /// Handler for a topic, if one is mapped
    pub fn handler(&self, topic: &str) -> Option<&Arc<dyn SinkHandler>> {
        self.handlers.get(topic)
    }

    /// Configured topics
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Number of mapped topics
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no topic is mapped
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn config() -> SinkConnectorConfig {
        let props: StdHashMap<String, String> = [
            ("neo4j.topic.cud", "mutations"),
            ("neo4j.topic.pattern.node.users", "(:User{!id,*})"),
            ("neo4j.topic.cdc.schema", "changes"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        SinkConnectorConfig::from_properties(&props).unwrap()
    }

    #[test]
    fn test_builds_one_handler_per_topic() {
        let registry = TopicRegistry::from_config(&config(), PipelineMetrics::shared()).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.handler("mutations").unwrap().strategy(), "cud");
        assert_eq!(
            registry.handler("users").unwrap().strategy(),
            "pattern.node"
        );
        assert!(registry.handler("unknown").is_none());
    }
}
