//! Command-line interface

use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::client::{build_hub, GmailMessageSource};
use crate::config::Config;
use crate::consumer::{JsonLinesPublisher, ResultPublisher};
use crate::error::{Result, TriageError};
use crate::ingestion::{SyncScheduler, SyncWorker, UserSummary};
use crate::models::{ClassificationResult, NormalizedEmail};
use crate::rate_limiter::RateLimiter;
use crate::rules::{RuleEngine, RuleStatistics};
use crate::sync_state::{FileStateStore, SyncState, SyncStateTracker};

/// Environment variable holding the Gmail bearer token for `sync`
pub const ACCESS_TOKEN_ENV: &str = "GMAIL_ACCESS_TOKEN";

#[derive(Parser, Debug)]
#[command(name = "gmail-triage")]
#[command(version = "0.1.0")]
#[command(about = "Rule-based Gmail triage with adaptive, rate-limited sync", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load and validate a rules document
    CheckRules {
        /// Rules document (defaults to classification.rules_path)
        #[arg(short, long)]
        rules: Option<PathBuf>,
    },

    /// Show the active rules in evaluation order
    Rules {
        #[arg(short, long)]
        rules: Option<PathBuf>,
    },

    /// Classify emails from JSON files (one object or an array per file)
    Classify {
        /// Input files
        #[arg(short, long, required = true, num_args = 1..)]
        input: Vec<PathBuf>,

        #[arg(short, long)]
        rules: Option<PathBuf>,
    },

    /// Sync mailboxes from Gmail and classify new messages
    Sync {
        /// Gmail user ids to sync ("me" for the token owner)
        #[arg(short, long, required = true, num_args = 1..)]
        user: Vec<String>,

        /// Run a single cycle per user and exit
        #[arg(long)]
        once: bool,
    },

    /// Show stored sync state for a user
    Status {
        #[arg(short, long)]
        user: String,
    },

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

/// Truncate a string to max_len characters, adding "..." if truncated
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_len.saturating_sub(3)).collect::<String>())
    }
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
    bar_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn with_multi_progress(multi: MultiProgress) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        let bar_style = ProgressStyle::default_bar()
            .template("[{elapsed:>6}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        Self {
            multi,
            spinner_style,
            bar_style,
        }
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    pub fn add_progress_bar(&self, len: u64, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(len));
        pb.set_style(self.bar_style.clone());
        pb.set_message(msg.to_string());
        pb
    }

    /// Finish a spinner and leave a one-line summary in its place
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        let _ = self.multi.println(format!("  ✓ {}", msg));
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::with_multi_progress(MultiProgress::new())
    }
}

/// Resolve the rules source: explicit flag, then config, then built-in rules
pub async fn load_engine(config: &Config, rules: Option<&Path>) -> Result<RuleEngine> {
    let path = rules.or(config.classification.rules_path.as_deref());
    RuleEngine::load_or_default(path).await
}

/// Read emails from a JSON file holding one object or an array of them
pub async fn read_emails(path: &Path) -> Result<Vec<NormalizedEmail>> {
    let content = tokio::fs::read_to_string(path).await?;
    let value: serde_json::Value = serde_json::from_str(&content)?;

    let emails = match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<NormalizedEmail>, _>>()?,
        other => vec![serde_json::from_value(other)?],
    };
    Ok(emails)
}

/// Classify every email in `inputs`, publishing each result
pub async fn run_classify(
    engine: &RuleEngine,
    inputs: &[PathBuf],
    publisher: &dyn ResultPublisher,
    reporter: &ProgressReporter,
) -> Result<Vec<ClassificationResult>> {
    let mut emails = Vec::new();
    for path in inputs {
        let batch = read_emails(path).await.map_err(|e| {
            TriageError::InvalidMessageFormat(format!("{}: {}", path.display(), e))
        })?;
        info!("Read {} emails from {}", batch.len(), path.display());
        emails.extend(batch);
    }

    let bar = reporter.add_progress_bar(emails.len() as u64, "Classifying");
    let mut results = Vec::with_capacity(emails.len());
    for email in &emails {
        let result = engine.classify(email);
        publisher.publish(&result).await?;
        results.push(result);
        bar.inc(1);
    }
    bar.finish_and_clear();

    Ok(results)
}

/// Render rule metadata and counters as a text table
pub fn format_rule_table(stats: &[RuleStatistics]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<4} {:<28} {:<14} {:>8} {:>10} {:>7} {:>9} {:>10}\n",
        "#", "Rule", "Category", "Priority", "Confidence", "Reply", "Matched", "Match rate"
    ));
    for (index, rule) in stats.iter().enumerate() {
        out.push_str(&format!(
            "{:<4} {:<28} {:<14} {:>8} {:>10.2} {:>7} {:>9} {:>9.1}%\n",
            index + 1,
            truncate_string(&rule.name, 28),
            truncate_string(&rule.category, 14),
            rule.priority,
            rule.confidence,
            if rule.needs_reply { "yes" } else { "no" },
            rule.times_matched,
            rule.match_rate * 100.0
        ));
    }
    out
}

/// Run the Gmail sync loop until Ctrl-C, or one cycle per user with `once`
pub async fn run_sync(config: &Config, engine: RuleEngine, users: Vec<String>, once: bool) -> Result<Vec<UserSummary>> {
    let token = std::env::var(ACCESS_TOKEN_ENV).map_err(|_| {
        TriageError::Config(format!(
            "{} must hold a Gmail access token for sync",
            ACCESS_TOKEN_ENV
        ))
    })?;

    let limiter = RateLimiter::new(config.rate_limit.capacity, config.rate_limit.refill_rate)?;
    let source = GmailMessageSource::new(
        build_hub(token)?,
        limiter,
        config.sync.query.clone(),
        config.sync.max_retries,
    );

    let store = Arc::new(FileStateStore::new(config.sync.state_dir.clone()));
    let tracker = Arc::new(SyncStateTracker::from_config(store, &config.polling, &config.sync));

    let worker = Arc::new(SyncWorker::new(
        Arc::new(source),
        Arc::new(engine),
        tracker,
        Arc::new(JsonLinesPublisher::stdout()),
        config.sync.max_messages_per_cycle,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, finishing in-flight messages");
            let _ = shutdown_tx.send(true);
        } else {
            warn!("Could not listen for Ctrl-C");
        }
    });

    info!(
        "Syncing {} users (strategy: {:?}, once: {})",
        users.len(),
        config.polling.strategy,
        once
    );
    SyncScheduler::new(worker).run(users, once, shutdown_rx).await
}

/// Stored state and next interval for one user
pub async fn load_status(config: &Config, user_id: &str) -> Result<(SyncState, Duration)> {
    let store = Arc::new(FileStateStore::new(config.sync.state_dir.clone()));
    let tracker = SyncStateTracker::from_config(store, &config.polling, &config.sync);
    let state = tracker.state(user_id).await?;
    let interval = tracker.get_next_poll_interval(user_id).await?;
    Ok((state, interval))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::ChannelPublisher;
    use crate::rules::RuleSet;
    use tempfile::TempDir;

    #[test]
    fn test_cli_parses_sync() {
        let cli = Cli::try_parse_from([
            "gmail-triage",
            "--json-logs",
            "sync",
            "--user",
            "alice@example.com",
            "bob@example.com",
            "--once",
        ])
        .unwrap();

        assert!(cli.json_logs);
        match cli.command {
            Commands::Sync { user, once } => {
                assert_eq!(user, vec!["alice@example.com", "bob@example.com"]);
                assert!(once);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_classify_requires_input() {
        assert!(Cli::try_parse_from(["gmail-triage", "classify"]).is_err());
    }

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("short", 10), "short");
        assert_eq!(truncate_string("a very long rule name", 10), "a very ...");
    }

    #[tokio::test]
    async fn test_read_emails_accepts_object_or_array() {
        let dir = TempDir::new().unwrap();
        let single = dir.path().join("single.json");
        let many = dir.path().join("many.json");

        let email = serde_json::json!({
            "email_id": "m1",
            "sender": "a@example.com",
            "date": "2024-01-01T00:00:00Z"
        });
        tokio::fs::write(&single, email.to_string()).await.unwrap();
        tokio::fs::write(&many, serde_json::json!([email, email]).to_string())
            .await
            .unwrap();

        assert_eq!(read_emails(&single).await.unwrap().len(), 1);
        assert_eq!(read_emails(&many).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_run_classify_publishes_in_input_order() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("emails.json");
        let emails = serde_json::json!([
            {"email_id": "m1", "sender": "x@linkedin.com", "subject": "New job", "date": "2024-01-01T00:00:00Z"},
            {"email_id": "m2", "sender": "y@example.com", "subject": "Quarterly", "date": "2024-01-01T00:00:00Z"}
        ]);
        tokio::fs::write(&input, emails.to_string()).await.unwrap();

        let engine = RuleEngine::new(RuleSet::default_rules());
        let (publisher, mut rx) = ChannelPublisher::channel(8);
        let reporter = ProgressReporter::with_multi_progress(MultiProgress::with_draw_target(
            indicatif::ProgressDrawTarget::hidden(),
        ));

        let results = run_classify(&engine, &[input], &publisher, &reporter)
            .await
            .unwrap();

        assert_eq!(results[0].category, "social");
        assert!(results[1].is_uncategorized());
        assert_eq!(rx.recv().await.unwrap().email_id, "m1");
        assert_eq!(rx.recv().await.unwrap().email_id, "m2");

        let table = format_rule_table(&engine.statistics());
        assert!(table.contains("Social Media"));
    }

    #[tokio::test]
    async fn test_load_engine_prefers_flag_over_config() {
        let dir = TempDir::new().unwrap();
        let rules = dir.path().join("rules.json");
        tokio::fs::write(
            &rules,
            r#"{"rules": [{"name": "only", "category": "x", "needs_reply": false,
                "condition": {"field": "subject", "pattern": "x"}, "confidence": 0.5}]}"#,
        )
        .await
        .unwrap();

        let config = Config::default();
        assert_eq!(load_engine(&config, Some(&rules)).await.unwrap().snapshot().len(), 1);
        assert_eq!(load_engine(&config, None).await.unwrap().snapshot().len(), 6);
    }

    #[tokio::test]
    async fn test_status_for_unknown_user() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.sync.state_dir = dir.path().to_path_buf();

        let (state, interval) = load_status(&config, "nobody").await.unwrap();
        assert_eq!(state.version, 0);
        assert_eq!(interval, Duration::from_secs(300));
    }
}
