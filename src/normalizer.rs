//! Conversion from Gmail API messages to [`NormalizedEmail`]

use chrono::{DateTime, TimeZone, Utc};
use google_gmail1::api::{Message, MessagePart};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, TriageError};
use crate::models::NormalizedEmail;

static SCRIPT_OR_STYLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script[^>]*>.*?</script>|<style[^>]*>.*?</style>").unwrap()
});

static BLOCK_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<br\s*/?>|</p>|</div>|</li>|</tr>").unwrap());

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());

static BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").unwrap());

#[derive(Default)]
struct Bodies {
    text: Option<String>,
    html: Option<String>,
    has_attachments: bool,
}

/// Flatten a full-format Gmail message
pub fn normalize_message(message: Message, user_id: Option<&str>) -> Result<NormalizedEmail> {
    let email_id = message
        .id
        .ok_or_else(|| TriageError::InvalidMessageFormat("Missing message ID".to_string()))?;

    let payload = message.payload.ok_or_else(|| {
        TriageError::InvalidMessageFormat(format!("Message {} has no payload", email_id))
    })?;

    let mut sender = String::new();
    let mut recipient = String::new();
    let mut subject = String::new();
    let mut date_header = None;

    for header in payload.headers.iter().flatten() {
        if let (Some(name), Some(value)) = (&header.name, &header.value) {
            match name.to_lowercase().as_str() {
                "from" => sender = value.trim().to_string(),
                "to" => recipient = value.trim().to_string(),
                "subject" => subject = value.clone(),
                "date" => date_header = Some(value.clone()),
                _ => {}
            }
        }
    }

    if sender.is_empty() {
        return Err(TriageError::InvalidMessageFormat(format!(
            "Message {} has no From header",
            email_id
        )));
    }

    let date = message
        .internal_date
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        .or_else(|| date_header.as_deref().and_then(|d| parse_date(d).ok()))
        .ok_or_else(|| {
            TriageError::InvalidMessageFormat(format!("Message {} has no usable date", email_id))
        })?;

    let mut bodies = Bodies::default();
    collect_bodies(&payload, &mut bodies);

    let body_text = match (bodies.text, &bodies.html) {
        (Some(text), _) => text,
        (None, Some(html)) => html_to_text(html),
        (None, None) => String::new(),
    };

    Ok(NormalizedEmail {
        email_id,
        user_id: user_id.map(str::to_string),
        sender,
        recipient,
        subject,
        body_text,
        body_html: bodies.html,
        has_attachments: bodies.has_attachments,
        date,
        thread_id: message.thread_id,
        labels: message.label_ids.unwrap_or_default(),
    })
}

/// Depth-first walk over the MIME tree; the first text/plain and text/html
/// parts win
fn collect_bodies(part: &MessagePart, bodies: &mut Bodies) {
    let is_attachment = part.filename.as_deref().is_some_and(|f| !f.is_empty())
        || part
            .body
            .as_ref()
            .is_some_and(|b| b.attachment_id.is_some());

    if is_attachment {
        bodies.has_attachments = true;
    } else {
        let data = part
            .body
            .as_ref()
            .and_then(|b| b.data.as_deref())
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned());

        match (part.mime_type.as_deref(), data) {
            (Some("text/plain"), Some(text)) if bodies.text.is_none() => bodies.text = Some(text),
            (Some("text/html"), Some(html)) if bodies.html.is_none() => bodies.html = Some(html),
            _ => {}
        }
    }

    for child in part.parts.iter().flatten() {
        collect_bodies(child, bodies);
    }
}

/// Parse an RFC 2822 date, falling back to RFC 3339
pub fn parse_date(date_str: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(date_str)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| DateTime::parse_from_rfc3339(date_str).map(|dt| dt.with_timezone(&Utc)))
        .map_err(|e| TriageError::InvalidMessageFormat(format!("Invalid date format: {}", e)))
}

/// Rough plain-text rendering of an HTML body
pub fn html_to_text(html: &str) -> String {
    let without_scripts = SCRIPT_OR_STYLE.replace_all(html, " ");
    let with_breaks = BLOCK_BREAK.replace_all(&without_scripts, "\n");
    let stripped = TAG.replace_all(&with_breaks, "");
    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    decoded
        .lines()
        .map(|line| BLANK_RUN.replace_all(line.trim(), " ").into_owned())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use google_gmail1::api::{MessagePartBody, MessagePartHeader};

    fn header(name: &str, value: &str) -> MessagePartHeader {
        MessagePartHeader {
            name: Some(name.to_string()),
            value: Some(value.to_string()),
        }
    }

    fn part(mime_type: &str, data: &str) -> MessagePart {
        MessagePart {
            mime_type: Some(mime_type.to_string()),
            body: Some(MessagePartBody {
                data: Some(data.as_bytes().to_vec()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn message(payload: MessagePart) -> Message {
        Message {
            id: Some("18c2a".to_string()),
            thread_id: Some("18c29".to_string()),
            label_ids: Some(vec!["INBOX".to_string(), "UNREAD".to_string()]),
            internal_date: Some(1_700_000_000_000),
            payload: Some(payload),
            ..Default::default()
        }
    }

    fn headers() -> Vec<MessagePartHeader> {
        vec![
            header("From", "VIP Client <vip@vip-client.com>"),
            header("To", "me@example.com"),
            header("Subject", "Quarterly review"),
            header("Date", "Tue, 14 Nov 2023 22:13:20 +0000"),
        ]
    }

    #[test]
    fn test_multipart_alternative() {
        let payload = MessagePart {
            mime_type: Some("multipart/alternative".to_string()),
            headers: Some(headers()),
            parts: Some(vec![
                part("text/plain", "Hello in plain text"),
                part("text/html", "<p>Hello in <b>HTML</b></p>"),
            ]),
            ..Default::default()
        };

        let email = normalize_message(message(payload), Some("alice")).unwrap();

        assert_eq!(email.email_id, "18c2a");
        assert_eq!(email.user_id.as_deref(), Some("alice"));
        assert_eq!(email.sender, "VIP Client <vip@vip-client.com>");
        assert_eq!(email.recipient, "me@example.com");
        assert_eq!(email.subject, "Quarterly review");
        assert_eq!(email.body_text, "Hello in plain text");
        assert_eq!(email.body_html.as_deref(), Some("<p>Hello in <b>HTML</b></p>"));
        assert!(!email.has_attachments);
        assert_eq!(email.thread_id.as_deref(), Some("18c29"));
        assert_eq!(email.labels, vec!["INBOX", "UNREAD"]);
        assert_eq!(email.date.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_html_only_body_is_rendered_to_text() {
        let mut payload = part(
            "text/html",
            "<html><style>p {color: red}</style><p>Line&nbsp;one</p><p>Tom &amp; Jerry</p></html>",
        );
        payload.headers = Some(headers());

        let email = normalize_message(message(payload), None).unwrap();
        assert_eq!(email.body_text, "Line one\nTom & Jerry");
        assert!(email.body_html.is_some());
    }

    #[test]
    fn test_attachment_detection() {
        let attachment = MessagePart {
            mime_type: Some("application/pdf".to_string()),
            filename: Some("invoice.pdf".to_string()),
            body: Some(MessagePartBody {
                attachment_id: Some("att-1".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let payload = MessagePart {
            mime_type: Some("multipart/mixed".to_string()),
            headers: Some(headers()),
            parts: Some(vec![part("text/plain", "See attached"), attachment]),
            ..Default::default()
        };

        let email = normalize_message(message(payload), None).unwrap();
        assert!(email.has_attachments);
        assert_eq!(email.body_text, "See attached");
        assert!(email.body_html.is_none());
    }

    #[test]
    fn test_date_header_used_without_internal_date() {
        let mut payload = part("text/plain", "x");
        payload.headers = Some(headers());
        let mut msg = message(payload);
        msg.internal_date = None;

        let email = normalize_message(msg, None).unwrap();
        assert_eq!(email.date.to_rfc3339(), "2023-11-14T22:13:20+00:00");
    }

    #[test]
    fn test_missing_id_or_sender_rejected() {
        let mut payload = part("text/plain", "x");
        payload.headers = Some(headers());
        let mut msg = message(payload);
        msg.id = None;
        assert!(matches!(
            normalize_message(msg, None),
            Err(TriageError::InvalidMessageFormat(_))
        ));

        let mut payload = part("text/plain", "x");
        payload.headers = Some(vec![header("Subject", "no sender")]);
        assert!(normalize_message(message(payload), None).is_err());
    }

    #[test]
    fn test_parse_date_formats() {
        assert!(parse_date("Mon, 1 Jan 2024 10:00:00 +0100").is_ok());
        assert!(parse_date("2024-01-01T10:00:00Z").is_ok());
        assert!(parse_date("yesterday").is_err());
    }
}
