//! neo4j-connect - bridge between broker topics and a Neo4j property graph
//!
//! Two opposing connectors share one configuration substrate:
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//! │   Broker    │────▶│  Sink write  │────▶│    Neo4j    │
//! │   topics    │     │   pipeline   │     │  (Bolt)     │
//! └─────────────┘     └──────────────┘     └─────────────┘
//!        ▲                                        │
//!        └────────────── Source ◀─────────────────┘
//! ```
//!
//! The sink write pipeline translates per-topic record shapes into a
//! minimal, batched, idempotent sequence of graph statements:
//!
//! 1. The [`registry::TopicRegistry`] dispatches each record to the
//!    strategy configured for its topic.
//! 2. [`handlers`] translate records into `UNWIND $events`-style
//!    [`types::QueryEvents`], already grouped per statement shape.
//! 3. The [`grouper`] coalesces identical statements across handlers while
//!    preserving per-partition offset order.
//! 4. The [`engine::ExecutionEngine`] chunks, batches and commits the
//!    statements in one transaction, retrying transient driver failures.
//! 5. The [`sink_runner::SinkRunner`] commits consumer offsets only after
//!    the engine signals the batch committed, and routes refused records
//!    through the configured error policy (fail, skip, dead-letter).
//!
//! The broker client (consumer, producer, group coordination) is the
//! embedder's concern; it plugs in through the
//! [`sink_runner::BrokerConsumer`] and
//! [`dead_letter::DeadLetterPublisher`] traits.

pub mod cdc;
pub mod config;
pub mod dead_letter;
pub mod engine;
pub mod error;
pub mod grouper;
pub mod handlers;
pub mod metrics;
pub mod pattern;
pub mod query;
pub mod registry;
pub mod schema;
pub mod sink_runner;
pub mod source;
pub mod types;

pub use config::{ConnectConfig, ErrorPolicy, Neo4jConfig, SinkConnectorConfig};
pub use engine::{ExecutionEngine, GraphClient, Neo4jClient};
pub use error::{ConnectError, ConnectorStatus, Result, SinkError};
pub use handlers::{SinkHandler, Strategy, Translation};
pub use pattern::{NodePattern, PatternType, RelationshipPattern};
pub use registry::TopicRegistry;
pub use sink_runner::{BrokerConsumer, SinkRunner};
pub use types::{QueryEvents, SensitiveString, SinkRecord};
