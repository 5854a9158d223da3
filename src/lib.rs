//! Gmail Triage Library
//!
//! Classifies incoming email with a declarative rule engine and keeps each
//! mailbox in sync with adaptive, quota-aware polling.
//!
//! # Features
//!
//! - **Rules**: JSON rule documents with nested and/or/not conditions,
//!   literal and regex matchers, and per-rule match statistics
//! - **Rate Limiting**: Token bucket sized to Gmail's per-user quota
//! - **Sync State**: Durable per-user cursors with versioned writes
//! - **Polling**: Volume, time-of-day and hybrid interval strategies
//! - **Ingestion**: Cancellable sync cycles that advance the cursor only
//!   past messages that were classified and published
//!
//! # Example Usage
//!
//! ```no_run
//! use gmail_triage::{config::Config, rules::RuleEngine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!     let engine =
//!         RuleEngine::load_or_default(config.classification.rules_path.as_deref()).await?;
//!
//!     for rule in engine.statistics() {
//!         println!("{} -> {}", rule.name, rule.category);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`conditions`] - Condition trees and their evaluation
//! - [`rules`] - Rule sets, the hot-reloadable engine and statistics
//! - [`rate_limiter`] - Token bucket for Gmail quota units
//! - [`polling`] - Polling interval strategies
//! - [`sync_state`] - Per-user sync state, stores and the tracker
//! - [`normalizer`] - Gmail message to [`models::NormalizedEmail`]
//! - [`client`] - Rate-limited Gmail message source with retry logic
//! - [`consumer`] - Queue-facing classification consumer and publishers
//! - [`ingestion`] - Sync cycles and the multi-user scheduler
//! - [`config`] - Configuration management
//! - [`cli`] - Command-line interface
//! - [`error`] - Error types and result aliases

pub mod cli;
pub mod client;
pub mod conditions;
pub mod config;
pub mod consumer;
pub mod error;
pub mod ingestion;
pub mod models;
pub mod normalizer;
pub mod polling;
pub mod rate_limiter;
pub mod rules;
pub mod sync_state;

pub use error::{Result, TriageError};

pub use models::{ClassificationResult, EmailField, NormalizedEmail};

pub use conditions::{Condition, ConditionSpec, PatternSpec};
pub use rules::{RuleDefinition, RuleEngine, RuleSet, RuleSpec, RuleStatistics};

pub use rate_limiter::{QuotaCost, RateLimiter};

pub use polling::{HybridPolling, PollingStrategy, TimeBasedPolling, VolumeBasedPolling};
pub use sync_state::{
    FileStateStore, MemoryStateStore, StateStore, SyncCursor, SyncState, SyncStateTracker,
};

pub use client::{GmailMessageSource, MessageSource};
pub use consumer::{ClassificationConsumer, ResultPublisher};
pub use ingestion::{CycleReport, SyncScheduler, SyncWorker};

pub use config::Config;
