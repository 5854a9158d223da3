//! Queue boundary: one inbound email in, one classification result out
//!
//! The broker itself lives outside this crate. Inbound payloads arrive as raw
//! JSON bytes and results leave through a [`ResultPublisher`].

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Result, TriageError};
use crate::models::{ClassificationResult, NormalizedEmail};
use crate::rules::RuleEngine;

/// Downstream sink for classification results
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish(&self, result: &ClassificationResult) -> Result<()>;
}

/// Publishes into an in-process channel
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<ClassificationResult>,
}

impl ChannelPublisher {
    pub fn new(tx: mpsc::Sender<ClassificationResult>) -> Self {
        Self { tx }
    }

    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ClassificationResult>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl ResultPublisher for ChannelPublisher {
    async fn publish(&self, result: &ClassificationResult) -> Result<()> {
        self.tx
            .send(result.clone())
            .await
            .map_err(|_| TriageError::Publish("result channel closed".to_string()))
    }
}

/// Writes each result as one line of JSON
pub struct JsonLinesPublisher<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesPublisher<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonLinesPublisher<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W> ResultPublisher for JsonLinesPublisher<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn publish(&self, result: &ClassificationResult) -> Result<()> {
        let mut line = serde_json::to_vec(result)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&line)
            .await
            .map_err(|e| TriageError::Publish(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TriageError::Publish(e.to_string()))
    }
}

#[derive(Debug, Default)]
struct ConsumerCounters {
    received: AtomicU64,
    published: AtomicU64,
    malformed: AtomicU64,
    publish_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub published: u64,
    pub malformed: u64,
    pub publish_failures: u64,
}

/// Decodes inbound payloads, classifies them and publishes the results
pub struct ClassificationConsumer {
    engine: Arc<RuleEngine>,
    publisher: Arc<dyn ResultPublisher>,
    counters: ConsumerCounters,
}

impl ClassificationConsumer {
    pub fn new(engine: Arc<RuleEngine>, publisher: Arc<dyn ResultPublisher>) -> Self {
        Self {
            engine,
            publisher,
            counters: ConsumerCounters::default(),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<NormalizedEmail> {
        serde_json::from_slice(payload).map_err(|e| TriageError::QueuePayload(e.to_string()))
    }

    /// Handle one inbound payload
    ///
    /// A payload that cannot be decoded is logged, counted and acknowledged
    /// (`Ok(None)`). A publish failure is returned so the caller can
    /// redeliver.
    pub async fn handle(&self, payload: &[u8]) -> Result<Option<ClassificationResult>> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let email = match Self::decode(payload) {
            Ok(email) => email,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping malformed payload ({} bytes): {}", payload.len(), e);
                return Ok(None);
            }
        };

        let result = self.engine.classify(&email);
        if let Err(e) = self.publisher.publish(&result).await {
            self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Published {} -> {} ({})",
            result.email_id, result.category, result.explanation
        );
        Ok(Some(result))
    }

    /// Consume until the inbound channel closes
    pub async fn run(&self, mut inbound: mpsc::Receiver<Vec<u8>>) -> ConsumerStats {
        while let Some(payload) = inbound.recv().await {
            if let Err(e) = self.handle(&payload).await {
                warn!("Failed to publish classification result: {}", e);
            }
        }

        let stats = self.stats();
        info!(
            "Consumer stopped: received={}, published={}, malformed={}, publish_failures={}",
            stats.received, stats.published, stats.malformed, stats.publish_failures
        );
        stats
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.counters.received.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            publish_failures: self.counters.publish_failures.load(Ordering::Relaxed),
        }
    }
}
