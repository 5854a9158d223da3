use anyhow::Result;
use clap::Parser;
use gmail_triage::cli::{self, Cli, Commands, ProgressReporter};
use gmail_triage::config::Config;
use gmail_triage::consumer::JsonLinesPublisher;
use gmail_triage::error::TriageError;
use indicatif::MultiProgress;
use std::io::Write;
use std::process;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A writer that prints through MultiProgress to avoid progress bar conflicts
#[derive(Clone)]
struct MultiProgressWriter {
    multi: Arc<MultiProgress>,
    buffer: Vec<u8>,
}

impl MultiProgressWriter {
    fn new(multi: Arc<MultiProgress>) -> Self {
        Self {
            multi,
            buffer: Vec::new(),
        }
    }
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            let msg = String::from_utf8_lossy(&self.buffer);
            let msg = msg.trim_end_matches('\n');
            if !msg.is_empty() {
                let _ = self.multi.println(msg);
            }
            self.buffer.clear();
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// MakeWriter implementation for tracing
#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: Arc<MultiProgress>,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter::new(Arc::clone(&self.multi))
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        eprintln!("\nFor help, run: gmail-triage --help");
        process::exit(1);
    }
}

fn init_tracing(cli: &Cli, multi: &Arc<MultiProgress>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("gmail_triage=debug,info")
        } else {
            EnvFilter::new("gmail_triage=info,warn")
        }
    });

    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_current_span(false)
            .init();
    } else {
        // logs print above progress bars
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(MultiProgressMakeWriter {
                multi: Arc::clone(multi),
            })
            .with_target(false)
            .with_thread_ids(false)
            .init();
    }
}

async fn run() -> Result<()> {
    // Multiple dependencies pull in rustls; pick the provider explicitly
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let multi_progress = Arc::new(MultiProgress::new());
    init_tracing(&cli, &multi_progress);

    match cli.command {
        Commands::CheckRules { rules } => {
            let config = Config::load(&cli.config).await?;
            let engine = cli::load_engine(&config, rules.as_deref()).await?;
            let snapshot = engine.snapshot();

            let leaves: usize = snapshot.rules().iter().map(|r| r.condition.leaf_count()).sum();
            println!(
                "Rules OK: {} rules, {} conditions",
                snapshot.len(),
                leaves
            );
            Ok(())
        }

        Commands::Rules { rules } => {
            let config = Config::load(&cli.config).await?;
            let engine = cli::load_engine(&config, rules.as_deref()).await?;
            print!("{}", cli::format_rule_table(&engine.statistics()));
            Ok(())
        }

        Commands::Classify { input, rules } => {
            let reporter = ProgressReporter::with_multi_progress((*multi_progress).clone());

            let spinner = reporter.add_spinner("Loading rules...");
            let config = Config::load(&cli.config).await?;
            let engine = cli::load_engine(&config, rules.as_deref()).await?;
            reporter.finish_spinner(&spinner, &format!("Loaded {} rules", engine.snapshot().len()));

            let publisher = JsonLinesPublisher::stdout();
            let results = cli::run_classify(&engine, &input, &publisher, &reporter).await?;

            let uncategorized = results.iter().filter(|r| r.is_uncategorized()).count();
            eprintln!(
                "\nClassified {} emails ({} uncategorized, {} evaluation anomalies)\n",
                results.len(),
                uncategorized,
                engine.evaluation_anomalies()
            );
            eprint!("{}", cli::format_rule_table(&engine.statistics()));
            Ok(())
        }

        Commands::Sync { user, once } => {
            let config = Config::load(&cli.config).await?;
            let engine = cli::load_engine(&config, None).await?;

            tracing::info!("Gmail triage sync starting...");
            let summaries = cli::run_sync(&config, engine, user, once).await?;

            eprintln!("\n========================================");
            eprintln!("Sync Summary");
            eprintln!("========================================");
            for summary in &summaries {
                eprintln!(
                    "{}: {} cycles, {} messages, {} failed cycles",
                    summary.user_id,
                    summary.cycles,
                    summary.messages_processed,
                    summary.failed_cycles
                );
            }
            eprintln!("========================================");
            Ok(())
        }

        Commands::Status { user } => {
            let config = Config::load(&cli.config).await?;
            let (state, interval) = cli::load_status(&config, &user).await?;

            println!("\n========================================");
            println!("Sync State: {}", state.user_id);
            println!("========================================");
            if state.version == 0 {
                println!("Never synced.");
            } else {
                println!("Version: {}", state.version);
                if let Some(ts) = state.last_sync_timestamp {
                    println!("Last sync: {}", ts.format("%Y-%m-%d %H:%M:%S"));
                }
                if let Some(id) = &state.last_synced_message_id {
                    println!("Last message: {}", id);
                }
                if let Some(date) = state.last_message_date {
                    println!("Last message date: {}", date.format("%Y-%m-%d %H:%M:%S"));
                }
                println!("Messages synced: {}", state.total_messages_synced);
                println!("Recent cycle counts: {:?}", state.recent_counts);
                if let Some(cycle) = state.last_cycle_id {
                    println!("Last cycle: {}", cycle);
                }
            }
            println!("Next poll in: {}s", interval.as_secs());
            println!("========================================");
            Ok(())
        }

        Commands::InitConfig { output, force } => {
            tracing::info!("Generating example configuration file");

            if output.exists() && !force {
                return Err(TriageError::Config(format!(
                    "Configuration file already exists at {:?}. Use --force to overwrite.",
                    output
                ))
                .into());
            }

            Config::create_example(&output).await?;

            println!("Created example configuration file at: {:?}", output);
            println!("\nKey settings to review:");
            println!("  - classification.rules_path: rules document to load");
            println!("  - polling.strategy: 'volume', 'time' or 'hybrid'");
            println!("  - rate_limit.capacity / refill_rate: Gmail quota units");
            println!("  - sync.state_dir: where per-user sync state is kept");

            Ok(())
        }
    }
}
