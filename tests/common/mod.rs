//! Common test utilities and fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use gmail_triage::client::MessageSource;
use gmail_triage::consumer::ResultPublisher;
use gmail_triage::error::{Result, TriageError};
use gmail_triage::models::{ClassificationResult, NormalizedEmail};
use gmail_triage::sync_state::{StateStore, SyncCursor, SyncState};
use mockall::mock;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Base time for generated mailboxes
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

/// Create a test email with default values
pub fn create_test_email(id: &str, sender: &str, subject: &str) -> NormalizedEmail {
    NormalizedEmail {
        email_id: id.to_string(),
        user_id: None,
        sender: sender.to_string(),
        recipient: "me@example.com".to_string(),
        subject: subject.to_string(),
        body_text: String::new(),
        body_html: None,
        has_attachments: false,
        date: base_time(),
        thread_id: Some(format!("thread_{}", id)),
        labels: vec!["INBOX".to_string()],
    }
}

/// `count` emails one minute apart, ids `{prefix}-0 ..`
pub fn create_mailbox(prefix: &str, count: usize) -> Vec<NormalizedEmail> {
    (0..count)
        .map(|i| {
            let mut email = create_test_email(
                &format!("{}-{}", prefix, i),
                "someone@example.com",
                &format!("Message {}", i),
            );
            email.date = base_time() + Duration::minutes(i as i64);
            email
        })
        .collect()
}

/// Path of the rules document shipped with the crate
pub fn example_rules_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/rules.example.json")
}

/// In-memory mailbox per user, kept oldest first
#[derive(Default)]
pub struct FakeMessageSource {
    mailboxes: Mutex<HashMap<String, Vec<NormalizedEmail>>>,
    missing: Mutex<HashSet<String>>,
    fail_fetch_of: Mutex<HashSet<String>>,
    fetches: AtomicUsize,
}

impl FakeMessageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mailbox(self, user_id: &str, emails: Vec<NormalizedEmail>) -> Self {
        self.deliver(user_id, emails);
        self
    }

    /// Append new mail to a user's mailbox
    pub fn deliver(&self, user_id: &str, emails: Vec<NormalizedEmail>) {
        let mut mailboxes = self.mailboxes.lock().unwrap();
        let mailbox = mailboxes.entry(user_id.to_string()).or_default();
        mailbox.extend(emails);
        mailbox.sort_by_key(|e| e.date);
    }

    /// Fetching `id` reports the message as deleted
    pub fn mark_missing(&self, id: &str) {
        self.missing.lock().unwrap().insert(id.to_string());
    }

    /// Fetching `id` fails with a server error
    pub fn fail_fetch(&self, id: &str) {
        self.fail_fetch_of.lock().unwrap().insert(id.to_string());
    }

    pub fn clear_failures(&self) {
        self.fail_fetch_of.lock().unwrap().clear();
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSource for FakeMessageSource {
    async fn list_new_message_ids(
        &self,
        user_id: &str,
        cursor: Option<&SyncCursor>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let mailboxes = self.mailboxes.lock().unwrap();
        let mailbox = mailboxes.get(user_id).cloned().unwrap_or_default();

        let newer: Vec<String> = match cursor {
            Some(cursor) => {
                let start = mailbox
                    .iter()
                    .position(|e| e.email_id == cursor.message_id)
                    .map(|i| i + 1)
                    .unwrap_or(0);
                mailbox[start..]
                    .iter()
                    .filter(|e| e.date >= cursor.message_date)
                    .map(|e| e.email_id.clone())
                    .take(limit)
                    .collect()
            }
            None => {
                let skip = mailbox.len().saturating_sub(limit);
                mailbox[skip..].iter().map(|e| e.email_id.clone()).collect()
            }
        };
        Ok(newer)
    }

    async fn fetch_message(&self, user_id: &str, message_id: &str) -> Result<NormalizedEmail> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if self.fail_fetch_of.lock().unwrap().contains(message_id) {
            return Err(TriageError::Server {
                status: 503,
                message: "backend unavailable".to_string(),
            });
        }
        if self.missing.lock().unwrap().contains(message_id) {
            return Err(TriageError::MessageNotFound(message_id.to_string()));
        }

        let mailboxes = self.mailboxes.lock().unwrap();
        mailboxes
            .get(user_id)
            .and_then(|m| m.iter().find(|e| e.email_id == message_id))
            .cloned()
            .map(|mut email| {
                email.user_id = Some(user_id.to_string());
                email
            })
            .ok_or_else(|| TriageError::MessageNotFound(message_id.to_string()))
    }
}

// Mock implementation of StateStore for testing
mock! {
    pub StateStore {}

    #[async_trait::async_trait]
    impl StateStore for StateStore {
        async fn load(&self, user_id: &str) -> Result<Option<SyncState>>;
        async fn compare_and_set(
            &self,
            user_id: &str,
            expected_version: u64,
            next: &SyncState,
        ) -> Result<()>;
    }
}

// Mock implementation of ResultPublisher for testing
mock! {
    pub Publisher {}

    #[async_trait::async_trait]
    impl ResultPublisher for Publisher {
        async fn publish(&self, result: &ClassificationResult) -> Result<()>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mailbox_is_ordered() {
        let mailbox = create_mailbox("m", 3);
        assert_eq!(mailbox[0].email_id, "m-0");
        assert!(mailbox[0].date < mailbox[2].date);
    }

    #[tokio::test]
    async fn test_fake_source_lists_after_cursor() {
        let source = FakeMessageSource::new().with_mailbox("alice", create_mailbox("m", 5));
        let cursor = SyncCursor {
            message_id: "m-1".to_string(),
            message_date: base_time() + Duration::minutes(1),
        };

        let ids = source
            .list_new_message_ids("alice", Some(&cursor), 10)
            .await
            .unwrap();
        assert_eq!(ids, vec!["m-2", "m-3", "m-4"]);

        let recent = source.list_new_message_ids("alice", None, 2).await.unwrap();
        assert_eq!(recent, vec!["m-3", "m-4"]);
    }
}
