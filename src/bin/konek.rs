//! Operator tool for the request store: inspect requests, find completions
//! that need reconciliation, and check the local ledger.

use anyhow::{Context, Result};
use barangay_konek::{
    app::Konek,
    config::{Config, seconds},
    machine::RequestState,
    telemetry,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "konek", version, about = "Barangay Konek request store operator tool.")]
struct Cli {
    /// Path to the TOML config. Defaults apply when omitted.
    #[clap(long, short)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print one request and the actions its state allows.
    Show { request_id: u64 },

    /// List paid requests stuck between storage and completion.
    Stalled {
        /// Override `reconcile.stale_after_secs`.
        #[clap(long)]
        older_than_secs: Option<u64>,
    },

    /// Walk the local ledger from its head and check every entry hash.
    VerifyLedger,

    /// List notifications waiting for the mail relay.
    Outbox,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    telemetry::init_tracing(&config.log)?;

    let konek = Konek::open(&config)?;

    match cli.command {
        Commands::Show { request_id } => {
            let request = konek.requests.get_request(request_id).await?;
            let state = RequestState::of(&request);
            println!("request #{} ({})", request.id, request.document_type);
            println!("  requester:   {}", request.requester_id);
            println!("  purpose:     {}", request.purpose);
            println!("  priority:    {}", request.priority);
            println!("  state:       {state}");
            println!(
                "  document:    {}",
                request.document_url.as_deref().unwrap_or("-")
            );
            println!("  ledger tx:   {}", request.ledger_tx.as_deref().unwrap_or("-"));
            println!("  updated at:  {}", request.updated_at);
            let actions: Vec<&str> = state.available().iter().map(|t| t.as_str()).collect();
            println!("  actions:     {}", actions.join(", "));
        }
        Commands::Stalled { older_than_secs } => {
            let older_than = match older_than_secs {
                Some(secs) => seconds(secs).context("--older-than-secs")?,
                None => config.stale_after()?,
            };
            let stalled = konek.requests.stalled_completions(older_than).await?;
            if stalled.is_empty() {
                println!("no stalled completions");
            }
            for request in stalled {
                println!(
                    "#{}\t{}\t{}\t{}\t{}",
                    request.id,
                    RequestState::of(&request),
                    request.updated_at,
                    request.document_url.as_deref().unwrap_or("-"),
                    request.ledger_tx.as_deref().unwrap_or("-"),
                );
            }
        }
        Commands::VerifyLedger => {
            let length = konek.ledger.verify()?;
            println!("ledger ok, {length} entries");
        }
        Commands::Outbox => {
            for (id, mail) in konek.outbox.pending()? {
                println!("{id}\t{}\t{}", mail.to, mail.subject);
            }
        }
    }

    konek.flush().await
}
