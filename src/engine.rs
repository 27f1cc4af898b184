//! Batch execution engine
//!
//! Takes the grouped query events of a batch and commits them in a single
//! graph transaction. Parameter lists are chunked to a bounded size, each
//! chunk issued as one statement invocation. Transient driver failures
//! retry the whole batch with exponential backoff; permanent failures
//! surface to the caller, whose error policy decides what happens to the
//! records.
//!
//! A batch moves through `Building -> Submitted -> (Committed | Retrying ->
//! Submitted | Failed)`. [`ExecutionEngine::execute`] returning `Ok` is the
//! committed signal: the caller may commit consumer offsets once it sees
//! it.

use crate::config::Neo4jConfig;
use crate::error::{ConnectError, Result};
use crate::metrics::PipelineMetrics;
use crate::query::events_to_bolt;
use crate::types::QueryEvents;
use async_trait::async_trait;
use neo4rs::{ConfigBuilder, Graph};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// State of the batch currently owned by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Chunking and parameter conversion
    Building,
    /// Transaction in flight
    Submitted,
    /// Waiting out a backoff before resubmitting
    Retrying,
    /// Transaction committed
    Committed,
    /// Batch abandoned
    Failed,
}

/// Driver failure, classified for the retry loop
#[derive(Debug, Error)]
pub enum DriverError {
    /// Worth retrying: deadlocks, connection resets, leader elections
    #[error("transient: {0}")]
    Transient(String),
    /// Not worth retrying: constraint violations, syntax, type mismatches
    #[error("permanent: {0}")]
    Permanent(String),
}

/// Write access to the graph, one transaction per call
#[async_trait]
pub trait GraphClient: Send + Sync {
    /// Run every statement invocation inside one transaction and commit
    async fn execute_batch(
        &self,
        statements: &[QueryEvents],
    ) -> std::result::Result<(), DriverError>;

    /// Cheap connectivity probe
    async fn verify_connectivity(&self) -> std::result::Result<(), DriverError>;
}

/// [`GraphClient`] backed by a Bolt connection pool
pub struct Neo4jClient {
    graph: Graph,
}

impl Neo4jClient {
    /// Connect to the configured database
    pub async fn connect(config: &Neo4jConfig) -> Result<Self> {
        let mut builder = ConfigBuilder::default()
            .uri(config.uri.clone())
            .user(config.username.clone())
            .password(config.password.expose_secret().to_string());
        if let Some(db) = &config.database {
            builder = builder.db(db.clone());
        }
        let graph = Graph::connect(
            builder
                .build()
                .map_err(|e| ConnectError::config(e.to_string()))?,
        )
        .await
        .map_err(|e| ConnectError::config(format!("cannot reach graph: {e}")))?;
        Ok(Self { graph })
    }
}

fn classify(error: neo4rs::Error) -> DriverError {
    match &error {
        neo4rs::Error::ConnectionError => DriverError::Transient(error.to_string()),
        neo4rs::Error::Neo4j(e) if e.kind() == neo4rs::Neo4jErrorKind::Transient => {
            DriverError::Transient(error.to_string())
        }
        _ => DriverError::Permanent(error.to_string()),
    }
}

#[async_trait]
impl GraphClient for Neo4jClient {
    async fn execute_batch(
        &self,
        statements: &[QueryEvents],
    ) -> std::result::Result<(), DriverError> {
        let mut txn = self.graph.start_txn().await.map_err(classify)?;
        for group in statements {
            let events = events_to_bolt(&group.parameters)
                .map_err(|e| DriverError::Permanent(e.to_string()))?;
            let query = neo4rs::query(&group.statement).param("events", events);
            txn.run(query).await.map_err(classify)?;
        }
        txn.commit().await.map_err(classify)
    }

    async fn verify_connectivity(&self) -> std::result::Result<(), DriverError> {
        self.graph
            .run(neo4rs::query("RETURN 1"))
            .await
            .map_err(classify)
    }
}

/// Engine tunables
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum parameter entries per statement invocation
    pub batch_size: usize,
    /// Retry attempts after the initial one
    pub max_retries: u32,
    /// Initial backoff between retries
    pub retry_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_retries: 5,
            retry_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Backoff before the given retry attempt (1-indexed), exponential and
    /// capped
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = attempt.min(20);
        let backoff =
            self.retry_backoff.as_millis() as f64 * 2f64.powi(capped.saturating_sub(1) as i32);
        Duration::from_millis(backoff.min(self.max_backoff.as_millis() as f64) as u64)
    }
}

/// Receipt returned once a batch commits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReceipt {
    /// Statement invocations issued
    pub statements: usize,
    /// Parameter entries written
    pub parameters: usize,
    /// Attempts needed (1 = first try)
    pub attempts: u32,
}

/// Batched, retrying writer over a [`GraphClient`]
pub struct ExecutionEngine {
    client: Arc<dyn GraphClient>,
    config: EngineConfig,
    metrics: Arc<PipelineMetrics>,
    state: parking_lot::RwLock<BatchState>,
}

impl ExecutionEngine {
    /// Create an engine over a client
    pub fn new(
        client: Arc<dyn GraphClient>,
        config: EngineConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            client,
            config,
            metrics,
            state: parking_lot::RwLock::new(BatchState::Building),
        }
    }

    /// State of the most recent batch
    pub fn state(&self) -> BatchState {
        *self.state.read()
    }

    fn set_state(&self, state: BatchState) {
        *self.state.write() = state;
    }

    /// Split oversized parameter lists into bounded invocations, keeping
    /// both group order and parameter order
    fn chunk(&self, batch: Vec<QueryEvents>) -> Vec<QueryEvents> {
        let mut chunks = Vec::new();
        for group in batch {
            if group.parameters.len() <= self.config.batch_size {
                if !group.is_empty() {
                    chunks.push(group);
                }
                continue;
            }
            let mut parameters = group.parameters.into_iter().peekable();
            while parameters.peek().is_some() {
                let chunk: Vec<_> = parameters.by_ref().take(self.config.batch_size).collect();
                chunks.push(QueryEvents::new(group.statement.clone(), chunk));
            }
        }
        chunks
    }

    /// Commit a batch, retrying transient failures.
    ///
    /// Returns `Ok` only after the transaction committed; consumer offsets
    /// must not be committed before that.
    pub async fn execute(&self, batch: Vec<QueryEvents>) -> Result<BatchReceipt> {
        self.set_state(BatchState::Building);
        let chunks = self.chunk(batch);
        if chunks.is_empty() {
            self.set_state(BatchState::Committed);
            return Ok(BatchReceipt {
                statements: 0,
                parameters: 0,
                attempts: 0,
            });
        }
        let parameters: usize = chunks.iter().map(QueryEvents::len).sum();

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            self.set_state(BatchState::Submitted);

            match self.client.execute_batch(&chunks).await {
                Ok(()) => {
                    self.set_state(BatchState::Committed);
                    PipelineMetrics::incr(&self.metrics.batches_committed);
                    PipelineMetrics::add(&self.metrics.statements_executed, chunks.len() as u64);
                    debug!(
                        statements = chunks.len(),
                        parameters, attempts, "batch committed"
                    );
                    return Ok(BatchReceipt {
                        statements: chunks.len(),
                        parameters,
                        attempts,
                    });
                }
                Err(DriverError::Transient(message)) if attempts <= self.config.max_retries => {
                    self.set_state(BatchState::Retrying);
                    PipelineMetrics::incr(&self.metrics.batches_retried);
                    let delay = self.config.delay_for_attempt(attempts);
                    warn!(
                        attempt = attempts,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "transient driver failure, retrying batch: {message}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(DriverError::Transient(message)) => {
                    self.set_state(BatchState::Failed);
                    PipelineMetrics::incr(&self.metrics.batches_failed);
                    return Err(ConnectError::TransientDriver { message, attempts });
                }
                Err(DriverError::Permanent(message)) => {
                    self.set_state(BatchState::Failed);
                    PipelineMetrics::incr(&self.metrics.batches_failed);
                    info!("permanent driver failure, not retrying: {message}");
                    return Err(ConnectError::PermanentDriver(message));
                }
            }
        }
    }
}
