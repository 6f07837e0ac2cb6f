use clap::{Parser, Subcommand};
use common::{CoreConfig, Entry};
use futures::{StreamExt, TryStreamExt};
use std::path::Path;
use metadata::EntryEvent;
use tokio::fs::File;
use tokio::sync::broadcast;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use vfs::download::write_stream;
use vfs::{sync_dir, ByteRange, FileSystem, SyncOptions, VirtualFs, WriteOutcome};

#[derive(Parser)]
#[command(name = "chanfs")]
#[command(version, about = "Virtual file store on a channel backend", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "chanfs.toml", global = true)]
    config: String,

    /// Log filter, overrides RUST_LOG (e.g. info, vfs=debug)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Print the metadata change events produced by the command
    #[arg(long, global = true)]
    events: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List a folder
    Ls {
        #[arg(value_name = "PATH", default_value = "/")]
        path: String,

        /// Long format (type, size, modification time)
        #[arg(short, long)]
        long: bool,
    },

    /// Show one entry
    Stat {
        #[arg(value_name = "PATH")]
        path: String,
    },

    /// Create a folder
    Mkdir {
        #[arg(value_name = "PATH")]
        path: String,

        /// Create missing parents too
        #[arg(short, long)]
        parents: bool,
    },

    /// Upload a local file
    Put {
        #[arg(value_name = "LOCAL_PATH")]
        local_path: String,

        #[arg(value_name = "REMOTE_PATH")]
        remote_path: String,

        #[arg(long, default_value = "application/octet-stream")]
        mime: String,
    },

    /// Download a file, or a byte range of it
    Get {
        #[arg(value_name = "REMOTE_PATH")]
        remote_path: String,

        #[arg(value_name = "LOCAL_PATH")]
        local_path: String,

        /// Range header value, e.g. bytes=0-1023
        #[arg(long)]
        range: Option<String>,
    },

    /// Remove a file or folder
    Rm {
        #[arg(value_name = "PATH")]
        path: String,

        /// Remove folders with everything below them
        #[arg(short, long)]
        recursive: bool,
    },

    /// Move or rename
    Mv { src: String, dst: String },

    /// Copy a file or folder
    Cp { src: String, dst: String },

    /// Upload every file of a local directory tree that the folder lacks
    Sync {
        #[arg(value_name = "LOCAL_DIR")]
        local_dir: String,

        #[arg(value_name = "REMOTE_DIR")]
        remote_dir: String,

        /// Delete local files once they are stored
        #[arg(long)]
        delete_original: bool,

        #[arg(long, default_value = "application/octet-stream")]
        mime: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = CoreConfig::from_file(&cli.config)?;
    tracing::debug!("loaded config: {:?}", config);
    let fs = VirtualFs::from_config(&config).await?;
    let mut events = cli.events.then(|| fs.metadata().subscribe());

    let abort = CancellationToken::new();
    {
        let abort = abort.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling");
                abort.cancel();
            }
        });
    }

    handle_command(&fs, cli.command, abort).await?;

    if let Some(rx) = events.as_mut() {
        print_events(rx);
    }
    Ok(())
}

async fn handle_command(
    fs: &VirtualFs,
    command: Commands,
    abort: CancellationToken,
) -> anyhow::Result<()> {
    match command {
        Commands::Ls { path, long } => handle_ls(fs, &path, long).await?,
        Commands::Stat { path } => print_stat(&fs.stat(&path).await?),
        Commands::Mkdir { path, parents } => {
            let folder = if parents {
                fs.mkdir_all(&path).await?
            } else {
                fs.mkdir(&path).await?
            };
            println!("created {} ({})", path, folder.id);
        }
        Commands::Put {
            local_path,
            remote_path,
            mime,
        } => handle_put(fs, &local_path, &remote_path, &mime, abort).await?,
        Commands::Get {
            remote_path,
            local_path,
            range,
        } => handle_get(fs, &remote_path, &local_path, range.as_deref(), abort).await?,
        Commands::Rm { path, recursive } => {
            fs.remove(&path, recursive).await?;
            println!("removed {}", path);
        }
        Commands::Mv { src, dst } => {
            let entry = fs.rename(&src, &dst).await?;
            println!("moved {} to {} ({})", src, dst, entry.id);
        }
        Commands::Cp { src, dst } => {
            let entry = fs.copy(&src, &dst).await?;
            println!("copied {} to {} ({})", src, dst, entry.id);
        }
        Commands::Sync {
            local_dir,
            remote_dir,
            delete_original,
            mime,
        } => {
            let options = SyncOptions {
                delete_original,
                mime,
            };
            let report = sync_dir(fs, Path::new(&local_dir), &remote_dir, &options, abort).await?;
            for path in &report.failed {
                println!("failed {}", path);
            }
            println!(
                "synced {} into {}: {} uploaded, {} already present, {} failed",
                local_dir,
                remote_dir,
                report.uploaded.len(),
                report.skipped.len(),
                report.failed.len()
            );
            if report.aborted {
                anyhow::bail!("sync of {} was cancelled", local_dir);
            }
        }
    }
    Ok(())
}

async fn handle_ls(fs: &VirtualFs, path: &str, long: bool) -> anyhow::Result<()> {
    let entries = fs.list(path).await?;
    if entries.is_empty() {
        println!("No files found in {}", path);
        return Ok(());
    }
    for entry in entries {
        if long {
            let kind = if entry.is_folder() { "d" } else { "-" };
            let state = if entry.is_temp() { " (temp)" } else { "" };
            println!(
                "{} {:>12} {} {}{}",
                kind,
                entry.size(),
                entry.mtime.format("%Y-%m-%d %H:%M:%S"),
                entry.filename,
                state
            );
        } else {
            println!("{}", entry.filename);
        }
    }
    Ok(())
}

fn print_stat(entry: &Entry) {
    println!("Id: {}", entry.id);
    println!("Name: {}", entry.filename);
    println!("Type: {}", entry.kind);
    println!("State: {:?}", entry.state);
    println!("Size: {} bytes", entry.size());
    if let Some(channel) = &entry.channel {
        println!("Channel: {}", channel);
    }
    println!("Created At: {}", entry.ctime);
    println!("Modified At: {}", entry.mtime);
    if entry.is_inline() && !entry.is_folder() {
        println!("Stored: inline");
    }
    for part in &entry.parts {
        println!(
            "Part {}: message {} ({}, {} bytes)",
            part.index, part.message_id, part.original_filename, part.size
        );
    }
}

async fn handle_put(
    fs: &VirtualFs,
    local_path: &str,
    remote_path: &str,
    mime: &str,
    abort: CancellationToken,
) -> anyhow::Result<()> {
    let file = File::open(local_path).await?;
    let source = ReaderStream::with_capacity(file, common::UPLOAD_CHUNK)
        .map_err(common::Error::from)
        .boxed();
    match fs.write(remote_path, mime, source, abort).await? {
        WriteOutcome::Created(entry) => println!(
            "uploaded {} to {} ({}, {} bytes in {} parts)",
            local_path,
            remote_path,
            entry.id,
            entry.size(),
            entry.parts.len()
        ),
        WriteOutcome::Aborted => anyhow::bail!("upload of {} was cancelled", local_path),
    }
    Ok(())
}

async fn handle_get(
    fs: &VirtualFs,
    remote_path: &str,
    local_path: &str,
    range: Option<&str>,
    abort: CancellationToken,
) -> anyhow::Result<()> {
    let entry = fs.stat(remote_path).await?;
    let total = entry.size();
    let range = range.map(|header| ByteRange::parse(header, total)).transpose()?;

    let mut file = File::create(local_path).await?;
    let stream = fs.read_entry(&entry, range, abort.clone()).await?;
    let written = write_stream(stream, &mut file).await?;

    if abort.is_cancelled() {
        anyhow::bail!("download of {} was cancelled after {} bytes", remote_path, written);
    }
    match range {
        Some(range) => println!(
            "wrote {} bytes ({}) to {}",
            written,
            range.content_range(total),
            local_path
        ),
        None => println!("wrote {} bytes to {}", written, local_path),
    }
    Ok(())
}

fn print_events(rx: &mut broadcast::Receiver<EntryEvent>) {
    while let Ok(event) = rx.try_recv() {
        match event.previous() {
            Some(old) if old.filename != event.entry().filename => println!(
                "event: {} {} ({} -> {})",
                event.label(),
                event.entry().id,
                old.filename,
                event.entry().filename
            ),
            _ => println!(
                "event: {} {} ({})",
                event.label(),
                event.entry().id,
                event.entry().filename
            ),
        }
    }
}
