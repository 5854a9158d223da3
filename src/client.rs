//! Gmail message source with rate limiting and retry logic

use async_trait::async_trait;
use google_gmail1::{hyper_rustls, hyper_util, Gmail};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, TriageError};
use crate::models::NormalizedEmail;
use crate::normalizer::normalize_message;
use crate::rate_limiter::{QuotaCost, RateLimiter};
use crate::sync_state::SyncCursor;

pub type GmailHub =
    Gmail<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>>;

const READ_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";

/// Where the ingestion worker gets messages from
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Ids of messages newer than `cursor`, oldest first, at most `limit`
    ///
    /// Without a cursor the most recent `limit` messages are returned.
    async fn list_new_message_ids(
        &self,
        user_id: &str,
        cursor: Option<&SyncCursor>,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// Fetch and normalize one message
    async fn fetch_message(&self, user_id: &str, message_id: &str) -> Result<NormalizedEmail>;
}

#[async_trait]
impl<T: MessageSource + ?Sized> MessageSource for Arc<T> {
    async fn list_new_message_ids(
        &self,
        user_id: &str,
        cursor: Option<&SyncCursor>,
        limit: usize,
    ) -> Result<Vec<String>> {
        (**self).list_new_message_ids(user_id, cursor, limit).await
    }

    async fn fetch_message(&self, user_id: &str, message_id: &str) -> Result<NormalizedEmail> {
        (**self).fetch_message(user_id, message_id).await
    }
}

/// Build a Gmail hub authenticated with a bearer token
///
/// Obtaining and refreshing the token is left to the caller.
pub fn build_hub(access_token: String) -> Result<GmailHub> {
    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .map_err(|e| TriageError::Config(format!("Failed to load TLS roots: {}", e)))?
                .https_or_http()
                .enable_http1()
                .build(),
        );

    Ok(Gmail::new(client, access_token))
}

/// Production message source backed by the Gmail API
///
/// Every API call first takes its quota cost from the shared limiter.
pub struct GmailMessageSource {
    hub: GmailHub,
    limiter: RateLimiter,
    query: String,
    max_retries: u32,
}

impl GmailMessageSource {
    pub fn new(hub: GmailHub, limiter: RateLimiter, query: impl Into<String>, max_retries: u32) -> Self {
        Self {
            hub,
            limiter,
            query: query.into(),
            max_retries,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn query_after(&self, cursor: Option<&SyncCursor>) -> String {
        match cursor {
            // `after:` has one-second resolution; step back so messages
            // sharing the cursor's second are still listed
            Some(cursor) => format!("{} after:{}", self.query, cursor.message_date.timestamp() - 1),
            None => self.query.clone(),
        }
    }

    async fn list_page(
        &self,
        user_id: &str,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>)> {
        self.limiter.acquire_quota(QuotaCost::Read).await?;

        let mut call = self
            .hub
            .users()
            .messages_list(user_id)
            .q(query)
            .max_results(page_size);
        if let Some(token) = page_token {
            call = call.page_token(token);
        }

        let (_, response) = call.add_scope(READ_SCOPE).doit().await?;

        let ids = response
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| m.id)
            .collect();
        Ok((ids, response.next_page_token))
    }
}

#[async_trait]
impl MessageSource for GmailMessageSource {
    async fn list_new_message_ids(
        &self,
        user_id: &str,
        cursor: Option<&SyncCursor>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let query = self.query_after(cursor);
        let page_size = limit.clamp(1, 500) as u32;

        // Gmail lists newest first
        let mut newest_first = Vec::new();
        let mut page_token: Option<String> = None;

        'pages: loop {
            let (ids, next) = with_retry("messages.list", self.max_retries, || {
                self.list_page(user_id, &query, page_size, page_token.as_deref())
            })
            .await?;

            for id in ids {
                if cursor.is_some_and(|c| c.message_id == id) {
                    break 'pages;
                }
                newest_first.push(id);
            }

            // without a cursor one page of recent mail is enough
            if cursor.is_none() {
                break;
            }

            page_token = next;
            if page_token.is_none() {
                break;
            }
        }

        newest_first.reverse();
        newest_first.truncate(limit);
        debug!(
            "Listed {} new messages for {} (query: {})",
            newest_first.len(),
            user_id,
            query
        );
        Ok(newest_first)
    }

    async fn fetch_message(&self, user_id: &str, message_id: &str) -> Result<NormalizedEmail> {
        let message = with_retry("messages.get", self.max_retries, || async {
            self.limiter.acquire_quota(QuotaCost::Read).await?;
            let (_, message) = self
                .hub
                .users()
                .messages_get(user_id, message_id)
                .format("full")
                .add_scope(READ_SCOPE)
                .doit()
                .await?;
            Ok(message)
        })
        .await?;

        normalize_message(message, Some(user_id))
    }
}

/// Execute an async operation with exponential backoff retry
///
/// Rate-limit responses wait at least as long as the server asked.
pub async fn with_retry<T, F, Fut>(operation_name: &str, max_retries: u32, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_secs(1);
    let mut attempts = 0;

    loop {
        attempts += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempts <= max_retries => {
                let wait = match &e {
                    TriageError::RateLimitExceeded { retry_after } => {
                        delay.max(Duration::from_secs(*retry_after))
                    }
                    _ => delay,
                };
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name,
                    attempts,
                    max_retries + 1,
                    e,
                    wait
                );
                tokio::time::sleep(wait).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(30));
            }
            Err(e) => return Err(e),
        }
    }
}
