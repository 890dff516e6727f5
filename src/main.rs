use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;
use owo_colors::OwoColorize;
use pcsup::config::{EngineConfig, parse_rate};
use pcsup::engine::{Engine, create_super_file, rapid_upload, sum_file};
use pcsup::file::Hashes;
use pcsup::ledger::Ledger;
use pcsup::progress::{Phase, ProgressEvent};
use pcsup::remote::local::LocalRemote;
use pcsup::util::human_size;

#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable chunked uploads with rapid upload.", long_about = None)]
struct Cli {
    /// Engine config file (TOML). Defaults to the user config directory.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "info", value_name = "LEVEL")]
    log_level: LevelFilter,

    /// Also append log lines to this file.
    #[arg(long, global = true, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Root directory of the local object store standing in for the remote.
    #[arg(long, global = true, value_name = "DIR")]
    remote: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload files or directories into a remote directory.
    Upload(UploadArgs),

    /// Print the values needed to rapid upload files.
    Sumfile {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Create a remote file from hashes of content the remote already has.
    Rapidupload {
        #[arg(long)]
        length: u64,
        #[arg(long)]
        md5: String,
        #[arg(long)]
        slicemd5: String,
        #[arg(long, default_value = "")]
        crc32: String,
        target: String,
    },

    /// Merge uploaded blocks into a remote file.
    Createsuperfile {
        #[arg(long, value_name = "TARGET")]
        path: String,
        #[arg(required = true)]
        block_ids: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct UploadArgs {
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Remote directory to upload into.
    target: String,

    /// Parallel block uploads per file.
    #[arg(short, long)]
    parallel: Option<usize>,

    #[arg(long)]
    retry: Option<u32>,

    /// Skip the rapid upload check.
    #[arg(long)]
    norapid: bool,

    /// Upload each file as a single block.
    #[arg(long)]
    nosplit: bool,

    /// Rate limit per file, e.g. `2MB/s` or `512k`.
    #[arg(long, value_parser = parse_rate)]
    max_rate: Option<u64>,

    /// Print progress events as JSON lines.
    #[arg(long)]
    json: bool,
}

fn open_remote(root: Option<PathBuf>) -> anyhow::Result<Arc<LocalRemote>> {
    let root = root
        .or_else(|| EngineConfig::data_dir().map(|dir| dir.join("remote")))
        .ok_or(anyhow!(
            "Failed to determine the remote directory. Please designate one with --remote."
        ))?;
    log::debug!("Using remote store at {}", root.display());
    Ok(Arc::new(LocalRemote::open(root)?))
}

fn print_event(event: &ProgressEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    let id = format!("[{}]", event.task_id);
    match event.phase {
        Phase::Transferring => println!(
            "{} {} / {} at {}/s, {:.1}s",
            id.blue(),
            human_size(event.bytes_transferred).yellow(),
            human_size(event.total_bytes).blue(),
            human_size(event.speed),
            event.elapsed_ms as f64 / 1000.0
        ),
        Phase::Retrying => println!(
            "{} {} {}/{}: {}",
            id.blue(),
            "Retrying".yellow(),
            event.retry,
            event.max_retry,
            event.error.as_deref().unwrap_or_default()
        ),
        Phase::Failed => println!(
            "{} {} {}: {}",
            id.blue(),
            "Failed".red(),
            event.path,
            event.error.as_deref().unwrap_or_default()
        ),
        Phase::Succeeded => println!(
            "{} {} {} ({})",
            id.blue(),
            "Done".green(),
            event.path,
            human_size(event.total_bytes)
        ),
        Phase::DuplicateSkipped => {
            println!("{} {} {}", id.blue(), "Already exists".green(), event.path)
        }
        Phase::RapidUploaded => {
            println!("{} {} {}", id.blue(), "Rapid upload".green(), event.path)
        }
        Phase::Enqueued | Phase::Started => println!("{} {:?} {}", id.blue(), event.phase, event.path),
        Phase::Paused | Phase::Resumed | Phase::Cancelled => {
            println!("{} {}", id.blue(), format!("{:?}", event.phase).magenta())
        }
    }
    Ok(())
}

async fn upload(args: UploadArgs, config: EngineConfig, remote: Option<PathBuf>) -> anyhow::Result<()> {
    let remote = open_remote(remote)?;
    let ledger = match config.ledger_path() {
        Some(path) => Ledger::open(path)?,
        None => Ledger::in_memory(),
    };

    let mut options = config.transfer_options();
    options.parallelism = args.parallel.unwrap_or(options.parallelism);
    options.max_retry = args.retry.unwrap_or(options.max_retry);
    options.max_rate = args.max_rate.unwrap_or(options.max_rate);
    options.disable_dedup = args.norapid;
    options.disable_splitting = args.nosplit;

    let engine = Arc::new(Engine::new(remote, Arc::new(ledger), config));
    let subscription = engine.bus().subscribe();
    let mut queue = engine.queue();
    let handles = queue.enqueue_transfer(&args.paths, &args.target, options);
    if handles.is_empty() {
        bail!("Nothing to upload.");
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cancelling {} tasks", handles.len());
            for handle in &handles {
                handle.cancel();
            }
        }
    });

    let run = queue.run();
    tokio::pin!(run);
    let summary = loop {
        tokio::select! {
            summary = &mut run => break summary,
            Some(event) = subscription.recv() => print_event(&event, args.json)?,
        }
    };
    for event in subscription.drain() {
        print_event(&event, args.json)?;
    }

    if args.json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        println!(
            "{} succeeded, {} failed, {} cancelled, {} in total.",
            summary.succeeded.green(),
            summary.failed.red(),
            summary.cancelled.yellow(),
            human_size(summary.total_bytes).blue()
        );
    }

    if summary.failed > 0 {
        bail!("{} uploads failed", summary.failed);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    pcsup::util::log::init(cli.log_level, cli.log_file.clone())?;
    let config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Upload(args) => upload(args, config, cli.remote).await?,

        Command::Sumfile { paths } => {
            for path in paths {
                let sum = sum_file(&path)?;
                println!("[{}]", sum.path.display().blue());
                println!("  length:    {} ({})", sum.length, human_size(sum.length));
                println!("  md5:       {}", sum.hashes.full_hash);
                println!("  slice md5: {}", sum.hashes.slice_hash);
                println!("  crc32:     {}", sum.hashes.integrity);
                let name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                println!("  {}", sum.rapid_upload_command(&name).yellow());
            }
        }

        Command::Rapidupload {
            length,
            md5,
            slicemd5,
            crc32,
            target,
        } => {
            let remote = open_remote(cli.remote)?;
            let hashes = Hashes {
                full_hash: md5.to_ascii_lowercase(),
                slice_hash: slicemd5.to_ascii_lowercase(),
                integrity: crc32,
            };
            let saved = rapid_upload(remote.as_ref(), &target, &hashes, length).await?;
            println!("Rapid upload succeeded, saved to {}", saved.green());
        }

        Command::Createsuperfile { path, block_ids } => {
            let remote = open_remote(cli.remote)?;
            let saved = create_super_file(remote.as_ref(), &path, &block_ids).await?;
            println!("Created {} from {} blocks", saved.green(), block_ids.len());
        }
    }

    Ok(())
}
