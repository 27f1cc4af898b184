//! Sink runner - consumes broker records, writes graph mutations
//!
//! One runner serves one consumer (typically one per assigned partition
//! set). Each poll produces a batch: records dispatch through the topic
//! registry, translation failures route through the error policy, the
//! grouped query events commit through the execution engine, and consumer
//! offsets commit only after the engine signals the batch committed.
//!
//! Shutdown is cooperative: an in-flight batch gets a bounded grace period
//! to finish through its normal state machine, after which it is abandoned
//! and redelivered on restart.

use crate::config::{ErrorPolicy, GlobalSettings, SinkConnectorConfig};
use crate::dead_letter::{DeadLetterPublisher, DeadLetterRecord};
use crate::engine::{BatchReceipt, ExecutionEngine, GraphClient};
use crate::error::{ConnectError, ConnectorStatus, Result};
use crate::grouper;
use crate::handlers::RecordFailure;
use crate::metrics::PipelineMetrics;
use crate::registry::TopicRegistry;
use crate::types::{QueryEvents, SinkRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

/// Committed offsets per (topic, partition)
pub type OffsetMap = HashMap<(String, i32), i64>;

/// Record consumption seam; implemented by the embedding broker client
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Fetch up to `max_records`, waiting at most `timeout`
    async fn poll(&self, max_records: usize, timeout: Duration) -> Result<Vec<SinkRecord>>;

    /// Commit consumed offsets (next offset to read per partition)
    async fn commit(&self, offsets: &OffsetMap) -> Result<()>;
}

/// Sink runner state
pub struct SinkRunner {
    name: String,
    registry: TopicRegistry,
    engine: ExecutionEngine,
    policy: ErrorPolicy,
    dead_letter: Option<Arc<dyn DeadLetterPublisher>>,
    metrics: Arc<PipelineMetrics>,
    status: RwLock<ConnectorStatus>,
    records_consumed: AtomicU64,
    poll_max_records: usize,
    poll_timeout: Duration,
    shutdown_grace: Duration,
}

impl SinkRunner {
    /// Create a runner over a registry and engine
    pub fn new(
        name: impl Into<String>,
        registry: TopicRegistry,
        engine: ExecutionEngine,
        policy: ErrorPolicy,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            name: name.into(),
            registry,
            engine,
            policy,
            dead_letter: None,
            metrics,
            status: RwLock::new(ConnectorStatus::Starting),
            records_consumed: AtomicU64::new(0),
            poll_max_records: 500,
            poll_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }

    /// Wire a runner from validated configuration
    pub fn from_config(
        name: impl Into<String>,
        config: &SinkConnectorConfig,
        settings: &GlobalSettings,
        client: Arc<dyn GraphClient>,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self> {
        let registry = TopicRegistry::from_config(config, metrics.clone())?;
        let engine = ExecutionEngine::new(client, config.engine_config(), metrics.clone());
        Ok(
            Self::new(name, registry, engine, config.errors.policy(), metrics)
                .with_poll(
                    settings.poll_max_records,
                    Duration::from_millis(config.batch_timeout_ms),
                )
                .with_shutdown_grace(Duration::from_millis(settings.shutdown_grace_ms)),
        )
    }

    /// Attach the dead-letter publisher (builder-style)
    pub fn with_dead_letter(mut self, publisher: Arc<dyn DeadLetterPublisher>) -> Self {
        self.dead_letter = Some(publisher);
        self
    }

    /// Set poll sizing (builder-style)
    pub fn with_poll(mut self, max_records: usize, timeout: Duration) -> Self {
        self.poll_max_records = max_records;
        self.poll_timeout = timeout;
        self
    }

    /// Set the shutdown grace period (builder-style)
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Current status
    pub async fn status(&self) -> ConnectorStatus {
        *self.status.read().await
    }

    /// Records consumed so far
    pub fn records_consumed(&self) -> u64 {
        self.records_consumed.load(Ordering::Relaxed)
    }

    /// Run until shutdown or failure
    pub async fn run(
        &self,
        consumer: Arc<dyn BrokerConsumer>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        if matches!(self.policy, ErrorPolicy::DeadLetter(_)) && self.dead_letter.is_none() {
            return Err(ConnectError::config(
                "dead-letter policy configured without a publisher",
            ));
        }

        info!(
            sink = %self.name,
            topics = ?self.registry.topics().collect::<Vec<_>>(),
            "sink starting"
        );
        *self.status.write().await = ConnectorStatus::Running;

        let result = self.run_loop(consumer, shutdown_rx).await;

        *self.status.write().await = match &result {
            Ok(()) => ConnectorStatus::Stopped,
            Err(e) if e.is_shutdown() => ConnectorStatus::Stopped,
            Err(_) => ConnectorStatus::Failed,
        };
        if let Err(e) = &result {
            if !e.is_shutdown() {
                error!(sink = %self.name, "sink failed: {e}");
            }
        }
        result
    }

    async fn run_loop(
        &self,
        consumer: Arc<dyn BrokerConsumer>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!(sink = %self.name, "shutdown requested");
                return Ok(());
            }

            let records = tokio::select! {
                polled = consumer.poll(self.poll_max_records, self.poll_timeout) => polled?,
                _ = shutdown_rx.recv() => {
                    info!(sink = %self.name, "shutdown requested");
                    return Ok(());
                }
            };
            if records.is_empty() {
                continue;
            }

            let offsets = next_offsets(&records);
            let batch = self.process_batch(records);
            tokio::pin!(batch);

            let receipt = tokio::select! {
                receipt = &mut batch => receipt?,
                _ = shutdown_rx.recv() => {
                    // Let the in-flight batch finish within the grace period,
                    // then abandon it; uncommitted offsets mean redelivery.
                    match tokio::time::timeout(self.shutdown_grace, &mut batch).await {
                        Ok(receipt) => {
                            let receipt = receipt?;
                            consumer.commit(&offsets).await?;
                            debug!(sink = %self.name, parameters = receipt.parameters,
                                   "final batch committed during shutdown");
                            return Ok(());
                        }
                        Err(_) => {
                            warn!(
                                sink = %self.name,
                                grace_ms = self.shutdown_grace.as_millis() as u64,
                                "shutdown grace expired, abandoning in-flight batch"
                            );
                            return Ok(());
                        }
                    }
                }
            };

            // Offsets commit strictly after the engine's committed signal.
            consumer.commit(&offsets).await?;
            debug!(
                sink = %self.name,
                statements = receipt.statements,
                parameters = receipt.parameters,
                "batch committed, offsets advanced"
            );
        }
    }

    /// Translate, group and execute one polled batch
    pub async fn process_batch(&self, records: Vec<SinkRecord>) -> Result<BatchReceipt> {
        let mut events: Vec<QueryEvents> = Vec::new();
        let mut failures: Vec<RecordFailure> = Vec::new();

        for (topic, topic_records) in partition_by_topic(&records) {
            match self.registry.handler(topic) {
                Some(handler) => {
                    let translation = handler.handle(&topic_records);
                    events.extend(translation.events);
                    failures.extend(translation.failures);
                }
                None => {
                    for record in topic_records {
                        failures.push(RecordFailure {
                            record: record.clone(),
                            error: crate::error::SinkError::UnmappedTopic(topic.to_string()),
                        });
                    }
                }
            }
        }

        self.route_failures(failures).await?;

        let grouped = grouper::group(events);
        match self.engine.execute(grouped).await {
            Ok(receipt) => {
                self.records_consumed
                    .fetch_add(records.len() as u64, Ordering::Relaxed);
                PipelineMetrics::add(&self.metrics.records_processed, records.len() as u64);
                Ok(receipt)
            }
            Err(ConnectError::PermanentDriver(message)) => {
                self.route_rejected_batch(&records, &message).await
            }
            Err(e) => Err(e),
        }
    }

    /// Route per-record translation failures through the error policy
    async fn route_failures(&self, failures: Vec<RecordFailure>) -> Result<()> {
        for failure in failures {
            let record = &failure.record;
            warn!(
                sink = %self.name,
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                kind = failure.error.kind(),
                "record refused: {}",
                failure.error
            );
            match &self.policy {
                ErrorPolicy::Fail => return Err(failure.error.into()),
                ErrorPolicy::Skip => {
                    PipelineMetrics::incr(&self.metrics.records_skipped);
                }
                ErrorPolicy::DeadLetter(topic) => {
                    self.publish_dead_letter(
                        topic,
                        DeadLetterRecord::new(
                            record,
                            failure.error.kind(),
                            &failure.error.to_string(),
                        ),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// A permanent driver failure rejects the whole batch; the policy
    /// decides whether that fails the connector or drains the records
    async fn route_rejected_batch(
        &self,
        records: &[SinkRecord],
        message: &str,
    ) -> Result<BatchReceipt> {
        match &self.policy {
            ErrorPolicy::Fail => Err(ConnectError::PermanentDriver(message.to_string())),
            ErrorPolicy::Skip => {
                warn!(
                    sink = %self.name,
                    records = records.len(),
                    "skipping batch after permanent driver failure: {message}"
                );
                PipelineMetrics::add(&self.metrics.records_skipped, records.len() as u64);
                Ok(BatchReceipt {
                    statements: 0,
                    parameters: 0,
                    attempts: 1,
                })
            }
            ErrorPolicy::DeadLetter(topic) => {
                for record in records {
                    warn!(
                        sink = %self.name,
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        kind = "permanent_driver",
                        "dead-lettering record after permanent driver failure"
                    );
                    self.publish_dead_letter(
                        topic,
                        DeadLetterRecord::new(record, "permanent_driver", message),
                    )
                    .await?;
                }
                Ok(BatchReceipt {
                    statements: 0,
                    parameters: 0,
                    attempts: 1,
                })
            }
        }
    }

    async fn publish_dead_letter(&self, topic: &str, record: DeadLetterRecord) -> Result<()> {
        let publisher = self
            .dead_letter
            .as_ref()
            .ok_or_else(|| ConnectError::config("dead-letter publisher missing"))?;
        publisher
            .publish(topic, record)
            .await
            .map_err(|e| ConnectError::DeadLetterPublishFailed(e.to_string()))?;
        PipelineMetrics::incr(&self.metrics.records_dead_lettered);
        Ok(())
    }
}

/// Compute the next offset to read per (topic, partition)
fn next_offsets(records: &[SinkRecord]) -> OffsetMap {
    let mut offsets = OffsetMap::new();
    for record in records {
        let entry = offsets
            .entry((record.topic.clone(), record.partition))
            .or_insert(record.offset + 1);
        *entry = (*entry).max(record.offset + 1);
    }
    offsets
}

/// Split a polled batch by topic, preserving record order within each topic
fn partition_by_topic(records: &[SinkRecord]) -> Vec<(&str, Vec<SinkRecord>)> {
    let mut order: Vec<&str> = Vec::new();
    let mut by_topic: HashMap<&str, Vec<SinkRecord>> = HashMap::new();
    for record in records {
        let topic = record.topic.as_str();
        if !by_topic.contains_key(topic) {
            order.push(topic);
        }
        by_topic.entry(topic).or_default().push(record.clone());
    }
    order
        .into_iter()
        .map(|topic| (topic, by_topic.remove(topic).unwrap_or_default()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkConnectorConfig;
    use crate::engine::{DriverError, EngineConfig, GraphClient};
    use serde_json::json;
    use tokio::sync::Mutex;

    struct MockClient {
        fail_with: Mutex<Option<DriverError>>,
        batches: Mutex<Vec<Vec<QueryEvents>>>,
    }

    impl MockClient {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                fail_with: Mutex::new(None),
                batches: Mutex::new(Vec::new()),
            })
        }

        fn failing(error: DriverError) -> Arc<Self> {
            Arc::new(Self {
                fail_with: Mutex::new(Some(error)),
                batches: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl GraphClient for MockClient {
        async fn execute_batch(
            &self,
            statements: &[QueryEvents],
        ) -> std::result::Result<(), DriverError> {
            if let Some(error) = self.fail_with.lock().await.take() {
                return Err(error);
            }
            self.batches.lock().await.push(statements.to_vec());
            Ok(())
        }

        async fn verify_connectivity(&self) -> std::result::Result<(), DriverError> {
            Ok(())
        }
    }

    struct MockPublisher {
        published: Mutex<Vec<(String, DeadLetterRecord)>>,
    }

    #[async_trait]
    impl DeadLetterPublisher for MockPublisher {
        async fn publish(
            &self,
            topic: &str,
            record: DeadLetterRecord,
        ) -> std::result::Result<(), ConnectError> {
            self.published.lock().await.push((topic.to_string(), record));
            Ok(())
        }
    }

    fn registry() -> TopicRegistry {
        let props: HashMap<String, String> = [
            ("neo4j.topic.pattern.node.users", "(:User{!id,*})"),
            ("neo4j.topic.cud", "mutations"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let config = SinkConnectorConfig::from_properties(&props).unwrap();
        TopicRegistry::from_config(&config, PipelineMetrics::shared()).unwrap()
    }

    fn runner(client: Arc<MockClient>, policy: ErrorPolicy) -> SinkRunner {
        let metrics = PipelineMetrics::shared();
        let engine = ExecutionEngine::new(
            client,
            EngineConfig {
                retry_backoff: Duration::from_millis(1),
                ..EngineConfig::default()
            },
            metrics.clone(),
        );
        SinkRunner::new("test", registry(), engine, policy, metrics)
    }

    fn user_record(offset: i64, id: i64) -> SinkRecord {
        SinkRecord::new("users", 0, offset).with_value(json!({"id": id, "name": "x"}))
    }

    #[tokio::test]
    async fn test_batch_flows_to_client() {
        let client = MockClient::ok();
        let runner = runner(client.clone(), ErrorPolicy::Fail);

        let receipt = runner
            .process_batch(vec![user_record(0, 1), user_record(1, 2)])
            .await
            .unwrap();

        assert_eq!(receipt.parameters, 2);
        let batches = client.batches.lock().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].parameters.len(), 2);
    }

    #[tokio::test]
    async fn test_unmapped_topic_fails_with_none_tolerance() {
        let runner = runner(MockClient::ok(), ErrorPolicy::Fail);
        let record = SinkRecord::new("unknown", 0, 0).with_value(json!({"id": 1}));

        let err = runner.process_batch(vec![record]).await.unwrap_err();
        assert!(err.to_string().contains("unknown"));
    }

    #[tokio::test]
    async fn test_skip_policy_drops_bad_records() {
        let client = MockClient::ok();
        let runner = runner(client.clone(), ErrorPolicy::Skip);

        // One good record, one missing its key property.
        let bad = SinkRecord::new("users", 0, 1).with_value(json!({"name": "nokey"}));
        let receipt = runner
            .process_batch(vec![user_record(0, 1), bad])
            .await
            .unwrap();

        assert_eq!(receipt.parameters, 1);
        assert_eq!(
            runner.metrics.records_skipped.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_dead_letter_policy_publishes() {
        let client = MockClient::ok();
        let publisher = Arc::new(MockPublisher {
            published: Mutex::new(Vec::new()),
        });
        let runner = runner(client, ErrorPolicy::DeadLetter("dlq".to_string()))
            .with_dead_letter(publisher.clone());

        let bad = SinkRecord::new("users", 0, 7).with_value(json!({"name": "nokey"}));
        runner.process_batch(vec![bad]).await.unwrap();

        let published = publisher.published.lock().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "dlq");
        assert_eq!(published[0].1.offset, 7);
        assert_eq!(
            published[0].1.headers.get("__connect.errors.kind").map(String::as_str),
            Some("malformed_record")
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters_whole_batch() {
        let client = MockClient::failing(DriverError::Permanent("constraint violation".into()));
        let publisher = Arc::new(MockPublisher {
            published: Mutex::new(Vec::new()),
        });
        let runner = runner(client, ErrorPolicy::DeadLetter("dlq".to_string()))
            .with_dead_letter(publisher.clone());

        runner
            .process_batch(vec![user_record(0, 1), user_record(1, 2)])
            .await
            .unwrap();

        assert_eq!(publisher.published.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_with_none_tolerance() {
        let client = MockClient::failing(DriverError::Permanent("syntax".into()));
        let runner = runner(client, ErrorPolicy::Fail);

        let err = runner
            .process_batch(vec![user_record(0, 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::PermanentDriver(_)));
    }

    #[tokio::test]
    async fn test_run_commits_offsets_after_batch() {
        struct ScriptedConsumer {
            batches: Mutex<Vec<Vec<SinkRecord>>>,
            commits: Mutex<Vec<OffsetMap>>,
            shutdown_tx: broadcast::Sender<()>,
        }

        #[async_trait]
        impl BrokerConsumer for ScriptedConsumer {
            async fn poll(
                &self,
                _max_records: usize,
                _timeout: Duration,
            ) -> Result<Vec<SinkRecord>> {
                let mut batches = self.batches.lock().await;
                if let Some(batch) = batches.pop() {
                    Ok(batch)
                } else {
                    // Drained: ask the runner to stop.
                    let _ = self.shutdown_tx.send(());
                    Ok(Vec::new())
                }
            }

            async fn commit(&self, offsets: &OffsetMap) -> Result<()> {
                self.commits.lock().await.push(offsets.clone());
                Ok(())
            }
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let consumer = Arc::new(ScriptedConsumer {
            batches: Mutex::new(vec![vec![user_record(4, 1), user_record(5, 2)]]),
            commits: Mutex::new(Vec::new()),
            shutdown_tx,
        });

        let runner = runner(MockClient::ok(), ErrorPolicy::Fail);
        runner.run(consumer.clone(), shutdown_rx).await.unwrap();

        let commits = consumer.commits.lock().await;
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].get(&("users".to_string(), 0)), Some(&6));
        assert_eq!(runner.status().await, ConnectorStatus::Stopped);
        assert_eq!(runner.records_consumed(), 2);
    }

    #[tokio::test]
    async fn test_from_config_wiring() {
        let props: HashMap<String, String> = [
            ("neo4j.topic.cud", "mutations"),
            ("neo4j.batch.timeout.msecs", "1500"),
            ("errors.tolerance", "all"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let config = SinkConnectorConfig::from_properties(&props).unwrap();

        let runner = SinkRunner::from_config(
            "wired",
            &config,
            &GlobalSettings::default(),
            MockClient::ok(),
            PipelineMetrics::shared(),
        )
        .unwrap();

        assert_eq!(runner.poll_timeout, Duration::from_millis(1500));
        assert_eq!(runner.policy, ErrorPolicy::Skip);
        assert_eq!(runner.registry.len(), 1);
    }

    #[test]
    fn test_next_offsets() {
        let offsets = next_offsets(&[
            SinkRecord::new("a", 0, 5),
            SinkRecord::new("a", 0, 7),
            SinkRecord::new("a", 1, 2),
            SinkRecord::new("b", 0, 0),
        ]);
        assert_eq!(offsets.get(&("a".to_string(), 0)), Some(&8));
        assert_eq!(offsets.get(&("a".to_string(), 1)), Some(&3));
        assert_eq!(offsets.get(&("b".to_string(), 0)), Some(&1));
    }

    #[test]
    fn test_partition_by_topic_preserves_order() {
        let records = vec![
            SinkRecord::new("a", 0, 0),
            SinkRecord::new("b", 0, 0),
            SinkRecord::new("a", 0, 1),
        ];
        let partitioned = partition_by_topic(&records);
        assert_eq!(partitioned.len(), 2);
        assert_eq!(partitioned[0].0, "a");
        assert_eq!(partitioned[0].1.len(), 2);
        assert_eq!(partitioned[0].1[1].offset, 1);
    }
}
