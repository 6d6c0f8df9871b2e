//! Usecases layer - The three core pipelines and their building blocks.
//!
//! Ingestion, rule evaluation, and the intent/risk path live here,
//! orchestrating the domain types through the ports and the store.

pub mod breaker;
pub mod ingestion;
pub mod intent;
pub mod planner;
pub mod predicates;
pub mod risk;
pub mod rule_engine;
pub mod scoring;
pub mod synonyms;

pub use breaker::{BreakerConfig, CircuitBreakerTable};
pub use ingestion::IngestionPipeline;
pub use intent::{IntentError, IntentPipeline, IntentRequest};
pub use rule_engine::RuleEngine;
pub use synonyms::SynonymMatcher;
