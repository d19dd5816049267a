use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use epi_sync::{
    archive::ArchiveWriter,
    config::{Settings, load_settings_path},
    refresh::ArchiveOutcome,
    retention::RetentionScheduler,
    service::{Service, open_archive},
    telemetry::init_tracing,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(version, about = "Epidemiological dataset refresh and archive service")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Args)]
struct ConfigArg {
    #[arg(long, value_name = "FILE")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Cmd {
    /// Restore, then refresh and prune on schedule until Ctrl-C.
    Run(ConfigArg),
    /// One fetch/parse/publish/archive cycle, no retry.
    RefreshOnce(ConfigArg),
    /// Inspect or prune the archive.
    Archive(ArchiveCmd),
    /// Parse and validate the config, print the effective settings.
    CheckConfig(ConfigArg),
}

#[derive(Args)]
struct ArchiveCmd {
    #[command(subcommand)]
    sub: ArchiveSub,
}

#[derive(Subcommand)]
enum ArchiveSub {
    /// List entries with their age.
    List(ConfigArg),
    /// Run one retention cycle now.
    Prune(ConfigArg),
}

fn load(arg: &ConfigArg) -> Result<Settings> {
    let settings = load_settings_path(&arg.config)?;
    init_tracing(&settings.logging)?;
    Ok(settings)
}

async fn archive_writer(settings: &Settings) -> Result<ArchiveWriter> {
    let Some(store) = open_archive(&settings.archive).await.context("open archive")? else {
        bail!("archive.backend is \"disabled\"");
    };
    Ok(ArchiveWriter::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Cmd::Run(arg) => {
            let settings = load(&arg)?;
            let service = Service::build(&settings).await?;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested");
                }
                on_signal.cancel();
            });

            service.run(cancel).await?;
        }
        Cmd::RefreshOnce(arg) => {
            let settings = load(&arg)?;
            let service = Service::build(&settings).await?;
            let report = service.refresh_once().await.context("refresh failed")?;

            println!("publish:   {:?}", report.publish);
            println!("fetched:   {}", report.fetched_at.to_rfc3339());
            println!("bytes:     {}", report.payload_bytes);
            println!("countries: {}", report.countries);
            match &report.archive {
                ArchiveOutcome::Saved(entry) => println!("archived:  {} ({} bytes)", entry.key, entry.byte_len),
                ArchiveOutcome::Failed(e) => bail!("archive save failed: {e}"),
                ArchiveOutcome::Disabled => println!("archived:  no (disabled)"),
                ArchiveOutcome::Skipped => println!("archived:  no (stale publish)"),
            }
        }
        Cmd::Archive(ArchiveCmd {
            sub: ArchiveSub::List(arg),
        }) => {
            let settings = load(&arg)?;
            let writer = archive_writer(&settings).await?;
            let now = Utc::now();
            for entry in writer.entries().await? {
                let age = entry.key.age(now);
                println!(
                    "{}  {:>10} bytes  age {}d {}h",
                    entry.key,
                    entry.byte_len,
                    age.num_days(),
                    age.num_hours() % 24
                );
            }
        }
        Cmd::Archive(ArchiveCmd {
            sub: ArchiveSub::Prune(arg),
        }) => {
            let settings = load(&arg)?;
            let writer = archive_writer(&settings).await?;
            let report = RetentionScheduler::new(
                writer.store().clone(),
                settings.retention.horizon.get(),
            )
            .run_cycle()
            .await?;
            println!("{report}");
            if report.failed > 0 {
                bail!("{} expired entries could not be deleted", report.failed);
            }
        }
        Cmd::CheckConfig(arg) => {
            let settings = load_settings_path(&arg.config)?;
            print!("{}", toml::to_string_pretty(&settings)?);
        }
    }

    Ok(())
}
