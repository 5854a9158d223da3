use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Category assigned when no rule matches
pub const UNCATEGORIZED: &str = "uncategorized";

/// Explanation attached to the fallback result
pub const NO_RULE_MATCHED: &str = "no rule matched";

/// Provider-agnostic email record handed to the rule engine
///
/// Also the inbound queue payload: the surrounding service publishes one of
/// these per message, tagged with `email_id` (or the legacy `message_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEmail {
    #[serde(alias = "message_id", alias = "id")]
    pub email_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub sender: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body_text: String,
    #[serde(default)]
    pub body_html: Option<String>,
    #[serde(default)]
    pub has_attachments: bool,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Outbound record published for every classified email
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category: String,
    pub needs_reply: bool,
    pub confidence: f64,
    pub priority: i64,
    pub email_id: String,
    pub explanation: String,
}

impl ClassificationResult {
    /// Fallback result when no rule matched
    pub fn uncategorized(email_id: &str) -> Self {
        Self {
            category: UNCATEGORIZED.to_string(),
            needs_reply: false,
            confidence: 0.0,
            priority: 0,
            email_id: email_id.to_string(),
            explanation: NO_RULE_MATCHED.to_string(),
        }
    }

    pub fn is_uncategorized(&self) -> bool {
        self.category == UNCATEGORIZED
    }
}

/// Fields of [`NormalizedEmail`] that rule conditions may reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmailField {
    Sender,
    Recipient,
    Subject,
    Body,
    BodyHtml,
    HasAttachments,
    Date,
    ThreadId,
    Labels,
}

impl EmailField {
    pub const ALL: [EmailField; 9] = [
        EmailField::Sender,
        EmailField::Recipient,
        EmailField::Subject,
        EmailField::Body,
        EmailField::BodyHtml,
        EmailField::HasAttachments,
        EmailField::Date,
        EmailField::ThreadId,
        EmailField::Labels,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmailField::Sender => "sender",
            EmailField::Recipient => "recipient",
            EmailField::Subject => "subject",
            EmailField::Body => "body",
            EmailField::BodyHtml => "body_html",
            EmailField::HasAttachments => "has_attachments",
            EmailField::Date => "date",
            EmailField::ThreadId => "thread_id",
            EmailField::Labels => "labels",
        }
    }
}

impl fmt::Display for EmailField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmailField {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        EmailField::ALL
            .iter()
            .copied()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inbound_payload_accepts_message_id_alias() {
        let payload = json!({
            "message_id": "msg-1",
            "sender": "alice@example.com",
            "recipient": "me@example.com",
            "subject": "Hello",
            "body_text": "Hi there",
            "date": "2024-01-01T10:00:00Z",
            "labels": ["INBOX"]
        });

        let email: NormalizedEmail = serde_json::from_value(payload).unwrap();
        assert_eq!(email.email_id, "msg-1");
        assert!(email.body_html.is_none());
        assert!(!email.has_attachments);
        assert_eq!(email.labels, vec!["INBOX".to_string()]);
    }

    #[test]
    fn test_classification_result_is_flat_record() {
        let result = ClassificationResult::uncategorized("msg-9");
        let value = serde_json::to_value(&result).unwrap();

        assert_eq!(value["category"], "uncategorized");
        assert_eq!(value["needs_reply"], false);
        assert_eq!(value["confidence"], 0.0);
        assert_eq!(value["priority"], 0);
        assert_eq!(value["email_id"], "msg-9");
        assert_eq!(value["explanation"], "no rule matched");
        assert!(result.is_uncategorized());
    }

    #[test]
    fn test_email_field_parsing() {
        for field in EmailField::ALL {
            assert_eq!(field.as_str().parse::<EmailField>(), Ok(field));
        }
        assert_eq!("cc".parse::<EmailField>(), Err("cc".to_string()));
        assert_eq!("Subject".parse::<EmailField>(), Err("Subject".to_string()));
    }
}
