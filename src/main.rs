// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use bgfetch::config::{self, Config};
use bgfetch::download::{format_bytes, DownloadOptions, DownloadRequest};
use bgfetch::error::DownloadError;
use bgfetch::relaunch::{LogNotifier, RelaunchHandler};
use bgfetch::{files, logging, session};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Success - operation completed successfully
    pub const SUCCESS: i32 = 0;
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Data error - invalid URL or header
    pub const DATA_ERR: i32 = 65;
    /// Service unavailable - background session could not be created
    pub const SERVICE_UNAVAILABLE: i32 = 69;
    /// Internal software error - unexpected condition
    pub const SOFTWARE: i32 = 70;
    /// I/O error - file could not be saved or deleted
    pub const IO_ERR: i32 = 74;
    /// Temporary failure - network failure, try again later
    pub const TEMP_FAIL: i32 = 75;
    /// Configuration error - invalid config file
    pub const CONFIG: i32 = 78;
    /// Interrupted by Ctrl+C
    pub const CANCELED: i32 = 130;
}

use exit_codes::*;

mod progress {
    use anyhow::Result;
    use bgfetch::download::TransferProgress;
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    pub fn create() -> Result<ProgressBar> {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) | {msg}")?
                .progress_chars("█▓░"),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        pb.set_message("Connecting...");
        Ok(pb)
    }

    pub fn update(pb: &ProgressBar, progress: &TransferProgress) {
        if let Some(total) = progress.total_bytes_expected {
            pb.set_length(total);
        } else if pb.length() < Some(progress.total_bytes_written) {
            pb.set_length(progress.total_bytes_written);
        }
        pb.set_position(progress.total_bytes_written);
        pb.set_message("Downloading");
    }
}

#[derive(Parser)]
#[command(name = "bgfetch")]
#[command(version = VERSION)]
#[command(about = "Background downloads you can await.")]
#[command(long_about = "bgfetch - background downloads you can await\n\n\
    Download a file:     bgfetch get https://example.com/file.zip -o file.zip\n\
    Check a file:        bgfetch exists file.zip\n\
    Remove a file:       bgfetch delete file.zip\n\
    Show settings:       bgfetch config show")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a URL
    Get {
        url: String,
        /// Where to save the file (default: server-suggested name in the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Extra request header, e.g. -H 'Authorization: Bearer x'
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
        /// Do not follow redirects
        #[arg(long)]
        no_redirects: bool,
    },
    /// Check whether a downloaded file exists
    Exists { path: PathBuf },
    /// Delete a downloaded file
    Delete { path: PathBuf },
    /// Show configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Deliver pending events for a background session, as after a relaunch
    Relaunch { session_id: String },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Print the configuration file path
    Path,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init_logging(cli.verbose) {
        eprintln!("{} {}", "[!]".yellow(), e);
    }

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "[✗]".red(), e);
            ERROR
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Get {
            url,
            output,
            headers,
            no_redirects,
        } => {
            let config = match config::load_config() {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("{} {:#}", "[✗]".red(), e);
                    return Ok(CONFIG);
                }
            };
            let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
            runtime.block_on(get(&config, &url, output, &headers, !no_redirects))
        }
        Commands::Exists { path } => {
            if files::exists(&path) {
                println!("{} {}", "[OK]".green(), path.display());
                Ok(SUCCESS)
            } else {
                println!("{} {} does not exist", "[!]".yellow(), path.display());
                Ok(ERROR)
            }
        }
        Commands::Delete { path } => match files::delete(&path) {
            Ok(true) => {
                println!("{} Deleted {}", "[OK]".green(), path.display());
                Ok(SUCCESS)
            }
            Ok(false) => {
                println!("{} Nothing to delete at {}", "[!]".yellow(), path.display());
                Ok(SUCCESS)
            }
            Err(e) => {
                eprintln!("{} Could not delete {}: {}", "[✗]".red(), path.display(), e);
                Ok(IO_ERR)
            }
        },
        Commands::Config { command } => match command {
            ConfigCommand::Show => {
                let config = config::load_config()?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                println!();
                println!("  {} {}", "staging:".dimmed(), config.staging_dir().display());
                Ok(SUCCESS)
            }
            ConfigCommand::Path => {
                println!("{}", config::config_path()?.display());
                Ok(SUCCESS)
            }
        },
        Commands::Relaunch { session_id } => {
            let config = config::load_config()?;
            let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
            runtime.block_on(async move {
                let handler = RelaunchHandler::new(config, Arc::new(LogNotifier));
                let result = handler.handle_events_for_background_session(&session_id, || {
                    tracing::debug!("completion handler invoked");
                });
                match result {
                    Ok(replayed) if handler.owns(&session_id) => {
                        println!("{} Session {} resumed, {} event(s) delivered", "[OK]".green(), session_id.cyan(), replayed);
                        Ok(SUCCESS)
                    }
                    Ok(_) => {
                        println!("{} Session {} is not ours; ignored", "[!]".yellow(), session_id);
                        Ok(SUCCESS)
                    }
                    Err(e) => Ok(report(&e)),
                }
            })
        }
    }
}

async fn get(
    config: &Config,
    url: &str,
    output: Option<PathBuf>,
    headers: &[String],
    follow_redirects: bool,
) -> Result<i32> {
    let mut request = match build_request(url, headers) {
        Ok(request) => request,
        Err(e) => return Ok(report(&e)),
    };
    request = request.follow_redirects(follow_redirects);

    let downloader = match session::ensure_initialized(config) {
        Ok(downloader) => downloader,
        Err(e) => return Ok(report(&e)),
    };

    let pb = progress::create()?;
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    let _ = ctrlc::set_handler(move || {
        ctrl_c.cancel();
    });

    let bar = pb.clone();
    let mut options = DownloadOptions::new()
        .on_progress(move |p| progress::update(&bar, p))
        .cancellation(cancel);
    if let Some(path) = &output {
        options = options.destination(path);
    }

    let result = match downloader.start(request, options) {
        Ok(handle) => handle.wait().await,
        Err(e) => Err(e),
    };
    pb.finish_and_clear();

    let response = match result {
        Ok(response) => response,
        Err(e) => return Ok(report(&e)),
    };

    let status = response.status();
    let length = response.content_length().unwrap_or(0);
    let saved = match output {
        Some(path) => path,
        None => {
            let name = response
                .content()
                .suggested_filename()
                .map(sanitize_filename)
                .unwrap_or_else(|| "download".to_string());
            response
                .into_content()
                .persist(Path::new(&name))
                .with_context(|| format!("Failed to save {}", name))?
        }
    };

    if !status.is_success() {
        println!("{} Server returned {}; body saved to {}", "[!]".yellow(), status, saved.display());
        return Ok(ERROR);
    }

    println!("{} Saved {} to {}", "[OK]".green(), format_bytes(length), saved.display());
    Ok(SUCCESS)
}

fn build_request(url: &str, headers: &[String]) -> Result<DownloadRequest, DownloadError> {
    let mut request = DownloadRequest::get(url)?;
    for header in headers {
        let (name, value) = header.split_once(':').ok_or_else(|| {
            DownloadError::RequestConstruction(format!("header '{}' is not 'Name: value'", header))
        })?;
        request = request.header(name.trim(), value.trim())?;
    }
    Ok(request)
}

/// Keep only the final path component of a server-suggested name.
fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    if base.is_empty() || base == "." || base == ".." {
        "download".to_string()
    } else {
        base.to_string()
    }
}

fn report(error: &DownloadError) -> i32 {
    if error.is_canceled() {
        eprintln!("{} Download canceled", "[!]".yellow());
        return CANCELED;
    }
    eprint!("{}", error.explain().build().red());
    match error {
        DownloadError::RequestConstruction(_) => DATA_ERR,
        DownloadError::Transfer(_) => TEMP_FAIL,
        DownloadError::Io(_) => IO_ERR,
        DownloadError::Session(_) => SERVICE_UNAVAILABLE,
        DownloadError::Protocol(_) => SOFTWARE,
        DownloadError::Canceled => CANCELED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_headers() {
        let request = build_request(
            "https://example.com/a.bin",
            &["Authorization: Bearer abc".to_string(), "X-Trace:1".to_string()],
        )
        .unwrap();
        assert_eq!(request.headers["authorization"], "Bearer abc");
        assert_eq!(request.headers["x-trace"], "1");
    }

    #[test]
    fn test_build_request_rejects_bad_header() {
        let err = build_request("https://example.com/", &["no-colon".to_string()]).unwrap_err();
        assert!(matches!(err, DownloadError::RequestConstruction(_)));
        assert_eq!(report(&err), DATA_ERR);
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("dir\\file.txt"), "file.txt");
        assert_eq!(sanitize_filename(".."), "download");
    }

    #[test]
    fn test_cli_parses_get() {
        let cli = Cli::try_parse_from([
            "bgfetch", "-vv", "get", "https://example.com/x", "-o", "x.bin", "-H", "A: b", "--no-redirects",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Get { output, headers, no_redirects, .. } => {
                assert_eq!(output, Some(PathBuf::from("x.bin")));
                assert_eq!(headers, vec!["A: b".to_string()]);
                assert!(no_redirects);
            }
            _ => panic!("expected get"),
        }
    }
}
