use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use crosswatch_client::ClientConfig;
use crosswatch_core::Settings;
use crosswatch_sync::{MultiSiteSync, SiteView};

#[derive(Debug, Parser)]
#[command(name = "crosswatch")]
#[command(about = "Aggregated recent-changes view across independently-run wikis")]
struct Cli {
    /// Settings JSON document; malformed or missing files fall back to
    /// defaults with a warning.
    #[arg(long, default_value = "crosswatch.json")]
    settings: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every configured site once and print the aggregated feed.
    Once,
    /// Poll all sites on a fixed interval until interrupted.
    Live,
    /// Mark the watchlist as seen on every configured site.
    MarkSeen {
        /// Skip the confirmation the settings ask for.
        #[arg(long)]
        yes: bool,
    },
}

fn print_site(view: &SiteView) {
    println!("== {} ==", view.site);
    if view.has_error {
        println!("  (fetch failed; showing no entries for this site)");
        return;
    }
    if view.is_empty {
        println!("  (no unseen changes)");
        return;
    }
    for entry in &view.entries {
        let timestamp = entry.common.timestamp.as_deref().unwrap_or("--");
        let flags = entry.common.flags.as_deref().unwrap_or("");
        let comment = entry.common.comment_display.as_deref().unwrap_or("");
        let tags = entry.common.tags_display.as_deref().unwrap_or("");
        println!(
            "  {timestamp} {flags:<3} {}{comment} {tags}",
            entry.common.display_title
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.settings);
    if settings.sites.is_empty() {
        bail!("no sites configured; set \"sites\" in {}", cli.settings.display());
    }
    let sync = MultiSiteSync::from_settings(settings, ClientConfig::default())?;

    match cli.command.unwrap_or(Commands::Once) {
        Commands::Once => {
            let summary = sync.refresh_all().await;
            for view in sync.snapshot().await {
                print_site(&view);
            }
            println!(
                "refresh complete: run_id={} sites={} entries={} errors={}",
                summary.run_id,
                summary.sites,
                summary.total_entries,
                summary.sites_with_errors.len()
            );
        }
        Commands::Live => {
            // A terminal consumer is always "visible"; the sender stays
            // alive for the whole session so the loop never stops early.
            let (_visible_tx, visible_rx) = tokio::sync::watch::channel(true);
            tokio::select! {
                _ = sync.run_live(visible_rx) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Commands::MarkSeen { yes } => {
            if sync.settings().confirm_mark_all_sites && !yes {
                bail!("settings require confirmation for a bulk mark-as-seen; re-run with --yes");
            }
            sync.mark_all_as_seen().await;
            println!("marked as seen on {} sites", sync.sites().len());
        }
    }

    Ok(())
}
