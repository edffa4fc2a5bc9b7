// book-loader - ebook DRM removal core
// Copyright (C) 2025 book-loader contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use anyhow::{bail, Context};
use book_loader::adept::credential::CredentialStore;
use book_loader::config::LoaderConfig;
use book_loader::crypto;
use book_loader::kobo::{self, DeviceKeyDeriver, KoboLibrary};
use book_loader::workflow::TransactionOrchestrator;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "book-loader")]
#[command(about = "Remove ADEPT and Kobo DRM from purchased ebooks", long_about = None)]
struct Cli {
    /// Credential directory (default: $BOOK_LOADER_AUTH_DIR or ~/.config/book-loader/.adobe)
    #[arg(long, global = true)]
    auth_dir: Option<PathBuf>,

    /// Work directory for downloads and resume markers
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Redeem an .acsm voucher and decrypt the book
    Process {
        voucher: PathBuf,
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        /// Keep the encrypted download
        #[arg(long)]
        keep_encrypted: bool,
    },
    /// Remove DRM from an already downloaded EPUB or PDF
    Decrypt {
        file: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Inspect or reset the credential
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
    /// Kobo Desktop library
    Kobo {
        /// Kobo Desktop data directory
        #[arg(long)]
        kobo_dir: Option<PathBuf>,
        #[command(subcommand)]
        command: KoboCommands,
    },
}

#[derive(Subcommand)]
enum AuthCommands {
    Info,
    /// Delete every credential file
    Reset,
}

#[derive(Subcommand)]
enum KoboCommands {
    List,
    Decrypt {
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        /// Volume ids or titles; all volumes when empty
        books: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut builder = LoaderConfig::builder();
    if let Some(dir) = cli.auth_dir {
        builder = builder.auth_dir(dir);
    }
    if let Some(dir) = cli.work_dir {
        builder = builder.work_dir(dir);
    }

    match cli.command {
        Commands::Process {
            voucher,
            output,
            keep_encrypted,
        } => {
            let config = builder.keep_encrypted(keep_encrypted).build();
            let orchestrator = TransactionOrchestrator::new(&config)?;
            let cancel = orchestrator.cancel_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            match orchestrator.process_file(&voucher, &output).await {
                Ok(outcome) => {
                    let resumed = if outcome.resumed { " (resumed)" } else { "" };
                    println!("✅ {}{}", outcome.output.display(), resumed);
                }
                Err(failure) => {
                    let hint = if failure.retryable {
                        "run the same command again to retry"
                    } else if failure.source.is_auth_error() {
                        "check `book-loader auth info`"
                    } else {
                        "not retryable"
                    };
                    bail!("{} failed: {} ({})", failure.stage, failure.source.user_message(), hint);
                }
            }
        }
        Commands::Decrypt { file, output } => {
            let config = builder.build();
            let credential = CredentialStore::new(&config.auth_dir).load()?;
            let output = match output {
                Some(path) => path,
                None => {
                    let stem = file.file_stem().and_then(|s| s.to_str()).unwrap_or("book");
                    let ext = file.extension().and_then(|s| s.to_str()).unwrap_or("epub");
                    file.with_file_name(format!("{}_nodrm.{}", stem, ext))
                }
            };
            let report = tokio::task::spawn_blocking({
                let output = output.clone();
                move || crypto::remove_drm(&file, &output, &credential)
            })
            .await
            .context("decrypt task failed")??;
            if report.copied_unencrypted() {
                println!("ℹ️  not encrypted, copied to {}", output.display());
            } else {
                println!("✅ {}", output.display());
            }
        }
        Commands::Auth { command } => {
            let config = builder.build();
            let store = CredentialStore::new(&config.auth_dir);
            match command {
                AuthCommands::Info => {
                    let credential = store.load()?;
                    println!("Directory: {}", store.dir().display());
                    println!("User:      {}", credential.user_uuid);
                    println!("Device:    {}", credential.device_uuid);
                    println!("Kind:      {:?}", credential.auth_kind);
                    if let Some(username) = &credential.username {
                        println!("Username:  {}", username);
                    }
                    println!("Encoding:  {:?}", credential.encoding);
                }
                AuthCommands::Reset => {
                    let removed = store.reset()?;
                    println!("Removed {} credential file(s) from {}", removed, store.dir().display());
                }
            }
        }
        Commands::Kobo { kobo_dir, command } => {
            if let Some(dir) = kobo_dir {
                builder = builder.kobo_dir(dir);
            }
            let config = builder.build();
            match command {
                KoboCommands::List => {
                    let library = KoboLibrary::open(&config.kobo_dir).await?;
                    let volumes = library.volumes().await?;
                    library.close().await;
                    for volume in &volumes {
                        let drm = if volume.has_drm { "drm" } else { "free" };
                        println!(
                            "{:<40} {:<5} {} - {}",
                            volume.volume_id,
                            drm,
                            volume.title,
                            volume.author.as_deref().unwrap_or("unknown")
                        );
                    }
                    println!("{} volume(s)", volumes.len());
                }
                KoboCommands::Decrypt { output, books } => {
                    let deriver = DeviceKeyDeriver::new(config.hash_keys.clone());
                    let outcomes =
                        kobo::decrypt_books(&config.kobo_dir, output, &deriver, config.kobo_concurrency, &books)
                            .await?;
                    let mut failed = 0;
                    for outcome in &outcomes {
                        match &outcome.result {
                            Ok(report) => println!("✅ {} → {}", outcome.title, report.output.display()),
                            Err(e) => {
                                failed += 1;
                                println!("❌ {}: {}", outcome.title, e);
                            }
                        }
                    }
                    if failed > 0 {
                        bail!("{} of {} volume(s) failed", failed, outcomes.len());
                    }
                }
            }
        }
    }
    Ok(())
}
