use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use colored::Colorize;
use rangecache::fs::{CachingFileSystem, FileInfo, FileSystem};
use rangecache::store::{MemoryStoreConfig, StoreConfig};
use rangecache::RangeCacheConfig;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::time::Instant;
use tracing::{error, info};

/// Bytes shown by READ before the preview is cut
const PREVIEW_LEN: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "rangecache-cli")]
#[command(about = "rangecache CLI - read files through a shared byte-range cache", long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short = 'c', long)]
    config: Option<String>,

    /// Use an in-process store instead of the configured one
    #[arg(long)]
    memory: bool,

    /// Override the target protocol
    #[arg(short = 't', long)]
    target: Option<String>,

    /// Command to execute (if not in interactive mode)
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

struct CacheShell {
    fs: CachingFileSystem,
}

impl CacheShell {
    async fn connect(config: &RangeCacheConfig) -> Result<Self> {
        let fs = CachingFileSystem::new(config.caching_config())
            .await
            .context("failed to set up caching filesystem")?;
        Ok(Self { fs })
    }

    async fn execute_command(&self, command: &str, args: &[String]) -> Result<String> {
        let start = Instant::now();

        let response = match command.to_uppercase().as_str() {
            "READ" => self.cmd_read(args).await?,
            "CAT" => self.cmd_cat(args).await?,
            "INFO" => self.cmd_info(args).await?,
            "LS" => self.cmd_ls(args).await?,
            "KEYS" => self.cmd_keys().await?,
            "INVALIDATE" => self.cmd_invalidate().await?,
            "STATS" => self.cmd_stats(),
            "HELP" => help_text(),
            _ => return Err(anyhow::anyhow!("Unknown command: {}", command)),
        };

        let elapsed = start.elapsed();
        Ok(format!(
            "{}\n{}",
            response,
            format!("({:.2?})", elapsed).dimmed()
        ))
    }

    async fn cmd_read(&self, args: &[String]) -> Result<String> {
        if args.is_empty() {
            return Err(anyhow::anyhow!("Usage: READ path [start] [stop]"));
        }
        let start = parse_bound(args.get(1), "start")?;
        let stop = parse_bound(args.get(2), "stop")?;

        let bytes = self.fs.cat_file(&args[0], start, stop).await?;
        Ok(format!(
            "(bytes) {}\n{}",
            bytes.len(),
            hex_preview(&bytes)
        ))
    }

    async fn cmd_cat(&self, args: &[String]) -> Result<String> {
        if args.is_empty() {
            return Err(anyhow::anyhow!("Usage: CAT path [start] [stop]"));
        }
        let start = parse_bound(args.get(1), "start")?;
        let stop = parse_bound(args.get(2), "stop")?;

        let bytes = self.fs.cat_file(&args[0], start, stop).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn cmd_info(&self, args: &[String]) -> Result<String> {
        if args.is_empty() {
            return Err(anyhow::anyhow!("Usage: INFO path"));
        }
        let info = self.fs.info(&args[0]).await?;
        Ok(serde_json::to_string_pretty(&info)?)
    }

    async fn cmd_ls(&self, args: &[String]) -> Result<String> {
        let path = args.first().map(String::as_str).unwrap_or("/");
        let entries = self.fs.ls(path).await?;
        if entries.is_empty() {
            return Ok("(empty)".dimmed().to_string());
        }
        Ok(entries
            .iter()
            .enumerate()
            .map(|(i, entry)| format!("{}) {}", i + 1, format_entry(entry)))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn cmd_keys(&self) -> Result<String> {
        let keys = self.fs.cached_keys().await?;
        if keys.is_empty() {
            return Ok("(empty list)".dimmed().to_string());
        }
        Ok(keys
            .iter()
            .enumerate()
            .map(|(i, key)| format!("{}) \"{}\"", i + 1, key))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn cmd_invalidate(&self) -> Result<String> {
        let deleted = self.fs.invalidate_cache().await?;
        Ok(format!("(integer) {}", deleted))
    }

    fn cmd_stats(&self) -> String {
        let stats = self.fs.stats();
        format!(
            "{}\n  hits: {}\n  misses: {}\n  hit_rate: {:.2}\n  fetched_bytes: {}\n  bypassed: {}\n  store: {}\n  key_prefix: {}",
            "# Cache".bold(),
            stats.hits,
            stats.misses,
            stats.hit_rate(),
            stats.fetched_bytes,
            stats.bypassed,
            self.fs.store().name(),
            self.fs.key_prefix()
        )
    }

    async fn close(&self) -> Result<()> {
        self.fs.close().await?;
        Ok(())
    }
}

fn parse_bound(arg: Option<&String>, name: &str) -> Result<Option<u64>> {
    match arg.map(String::as_str) {
        None | Some("-") => Ok(None),
        Some(value) => value
            .parse::<u64>()
            .map(Some)
            .with_context(|| format!("{} must be a non-negative integer", name)),
    }
}

fn hex_preview(bytes: &Bytes) -> String {
    let shown = &bytes[..bytes.len().min(PREVIEW_LEN)];
    let hex = shown
        .chunks(16)
        .map(|line| {
            line.iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n");
    if bytes.len() > PREVIEW_LEN {
        format!("{}\n{}", hex, "...".dimmed())
    } else {
        hex
    }
}

fn format_entry(entry: &FileInfo) -> String {
    if entry.is_dir() {
        format!("{}/", entry.name).blue().to_string()
    } else {
        format!("{} {}", entry.name, format!("({} bytes)", entry.size).dimmed())
    }
}

fn help_text() -> String {
    format!(
        r#"{}

{}
  READ path [start] [stop]   Read a byte range through the cache, show a hex preview
  CAT path [start] [stop]    Read a byte range through the cache as text
  INFO path                  Show target metadata for path
  LS [path]                  List a target directory

{}
  KEYS                       List keys stored under the key prefix
  INVALIDATE                 Delete every key under the key prefix
  STATS                      Show hit/miss counters

{}
  HELP                       Show this help
  QUIT / EXIT                Exit the CLI

Use - for an open bound, e.g. READ /data/a.bin 100 -"#,
        "rangecache CLI Commands:".bold().cyan(),
        "Reads:".bold(),
        "Cache:".bold(),
        "Other:".bold(),
    )
}

fn load_config(args: &Args) -> Result<RangeCacheConfig> {
    let mut config = match &args.config {
        Some(path) => RangeCacheConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => RangeCacheConfig::default(),
    };
    if args.memory {
        config.store = StoreConfig::Memory(MemoryStoreConfig::default());
    }
    if let Some(protocol) = &args.target {
        config.target.protocol = protocol.clone();
    }
    Ok(config)
}

fn init_tracing(config: &RangeCacheConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false);

    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config);

    let shell = CacheShell::connect(&config).await?;

    if !args.command.is_empty() {
        // Command mode: execute single command and exit
        let cmd = &args.command[0];
        let cmd_args: Vec<String> = args.command[1..].to_vec();

        let result = shell.execute_command(cmd, &cmd_args).await;
        shell.close().await?;
        match result {
            Ok(output) => {
                info!("{}", output);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "{}", format!("Error: {}", e).red());
                std::process::exit(1);
            }
        }
    } else {
        run_interactive(&shell, &config).await?;
        shell.close().await
    }
}

async fn run_interactive(shell: &CacheShell, config: &RangeCacheConfig) -> Result<()> {
    info!(
        "{}",
        format!("rangecache CLI v{}", env!("CARGO_PKG_VERSION"))
            .bold()
            .cyan()
    );
    info!(
        "Caching {} through the {} store",
        config.target.protocol,
        shell.fs.store().name()
    );
    info!("Type {} for available commands\n", "HELP".bold());

    let mut rl = DefaultEditor::new()?;
    let prompt = format!("{}> ", format!("rangecache {}", config.target.protocol).green());

    loop {
        match rl.readline(&prompt) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }

                rl.add_history_entry(&line)?;

                let parts: Vec<String> = line.split_whitespace().map(String::from).collect();
                let cmd = &parts[0];
                let args = &parts[1..];

                if cmd.eq_ignore_ascii_case("QUIT") || cmd.eq_ignore_ascii_case("EXIT") {
                    info!("Goodbye!");
                    break;
                }

                match shell.execute_command(cmd, args).await {
                    Ok(output) => info!("{}", output),
                    Err(e) => {
                        error!(error = %e, "{}", format!("Error: {}", e).red());
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                info!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                info!("Goodbye!");
                break;
            }
            Err(err) => {
                error!(error = ?err, "Readline error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}
