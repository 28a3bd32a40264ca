use std::io::Write;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tempstore_server::cli::{Cli, Command};
use tempstore_server::{logging, open, run_server};
use tempstore_storage::expiry::describe_version;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    logging::init(&config.log_level);

    match cli.command {
        Command::Init => {
            open(&config).await?;
            println!("Initialized tempstore at {}", config.data_dir.display());
        }

        Command::Serve { .. } => {
            run_server(config).await?;
        }

        Command::Cleanup { .. } => {
            let (_, sweeper) = open(&config).await?;
            let report = sweeper.sweep().await?;
            println!("{report}");
        }

        Command::Put {
            project,
            version,
            file,
        } => {
            let (service, _) = open(&config).await?;
            let reader = File::open(&file)
                .await
                .with_context(|| format!("Failed to open {}", file.display()))?;
            let receipt = service.put(&project, &version, reader).await?;
            println!(
                "{project}/{version}: {} ({} bytes, {})",
                receipt.digest,
                receipt.size,
                receipt.outcome.as_str()
            );
        }

        Command::Get {
            project,
            version,
            output,
        } => {
            let (service, _) = open(&config).await?;
            let (_, mut reader) = service.get(&project, &version).await?;
            match output {
                Some(path) => {
                    let mut file = File::create(&path)
                        .await
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    tokio::io::copy(&mut reader, &mut file).await?;
                    file.flush().await?;
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    tokio::io::copy(&mut reader, &mut stdout).await?;
                    stdout.flush().await?;
                }
            }
        }

        Command::Star { project, version } => {
            let (service, _) = open(&config).await?;
            service.star(&project, &version)?;
            println!("Starred {project}/{version}");
        }

        Command::Unstar { project, version } => {
            let (service, _) = open(&config).await?;
            let record = service.unstar(&project, &version)?;
            let expiry = describe_version(&record, config.retention(), Utc::now());
            println!("Unstarred {project}/{version}, {expiry}");
        }

        Command::List { project: None } => {
            let (service, _) = open(&config).await?;
            let mut stdout = std::io::stdout().lock();
            for project in service.list_projects()? {
                writeln!(stdout, "{project}")?;
            }
        }

        Command::List {
            project: Some(project),
        } => {
            let (service, _) = open(&config).await?;
            let mut stdout = std::io::stdout().lock();
            for summary in service.list_versions(&project)? {
                writeln!(
                    stdout,
                    "{:<24} {}  {:>12}  {}  {}",
                    summary.version,
                    &summary.digest[..12],
                    summary.size,
                    summary.created_at.format("%Y-%m-%d %H:%M"),
                    summary.expiry
                )?;
            }
        }
    }

    Ok(())
}
