//! cdrop: encrypted, content-addressed file drop
//!
//! Commands:
//!   digest <file>            - print the SHA-256 content address of a file
//!   keygen                   - create a secp256k1 key pair
//!   send <file> ...          - encrypt for a recipient and publish the record
//!   receive <file> ...       - locate, decrypt and verify a received file
//!   config show              - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use cdrop_core::config::CdropConfig;
use cdrop_core::{SecretHex, TransferState};
use cdrop_transfer::store::expand_tilde;
use cdrop_transfer::{
    build_operator, ConflictResolution, ContentAddressProtocol, OperatorStore, ProgressFn,
    ReceiveOutcome, ReceiveRequest, RecordStore, S3Credentials, SendRequest, TaskRunner,
};

/// Suffix given to ciphertext files when no output path is chosen
const CIPHERTEXT_EXT: &str = "cdrop";

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "cdrop",
    version,
    about = "Encrypted, content-addressed file drop",
    long_about = "cdrop: encrypt files to a recipient key and find them again by ciphertext digest"
)]
struct Cli {
    /// Path to cdrop.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "CDROP_CONFIG",
        default_value = "~/.config/cdrop/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [log].level
    #[arg(long, env = "CDROP_LOG")]
    log: Option<String>,

    /// Log format; overrides [log].format
    #[arg(long, env = "CDROP_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq)]
enum OnConflict {
    /// Prompt on the terminal
    Ask,
    /// Keep the unverified file
    Keep,
    /// Delete the unverified file
    Discard,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the SHA-256 content address of a file
    Digest {
        file: PathBuf,
    },

    /// Generate a secp256k1 key pair (hex)
    Keygen,

    /// Encrypt a file for a recipient and publish its record
    ///
    /// S3 credentials are read from AWS_ACCESS_KEY_ID and
    /// AWS_SECRET_ACCESS_KEY when the store backend is s3.
    Send {
        /// Plaintext file
        file: PathBuf,
        /// Recipient public key (hex, SEC1)
        #[arg(long)]
        public_key: String,
        /// Private key matching --public-key (hex); stored in the record
        #[arg(long, env = "CDROP_PRIVATE_KEY", hide_env_values = true)]
        private_key: String,
        /// Ciphertext output path (default: <file>.cdrop)
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
        /// Display name recorded for the file (default: file name)
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        sender: Option<String>,
        #[arg(long)]
        recipient: Option<String>,
        #[arg(long)]
        price: Option<u64>,
    },

    /// Locate, decrypt and verify a received ciphertext
    Receive {
        /// Ciphertext file
        file: PathBuf,
        /// Plaintext output path (default: <file> without .cdrop)
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
        /// What to do when the store does not confirm the decrypted file
        #[arg(long, value_enum, default_value = "ask")]
        on_conflict: OnConflict,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = CdropConfig::load(&config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.unwrap_or(if config.log.format == "json" {
        LogFormat::Json
    } else {
        LogFormat::Text
    });
    init_logging(&level, format);
    debug!(config = %config_path.display(), "configuration loaded");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Digest { file } => cmd_digest(&config, &file, &cancel).await,
        Commands::Keygen => cmd_keygen(),
        Commands::Send {
            file,
            public_key,
            private_key,
            out,
            name,
            sender,
            recipient,
            price,
        } => {
            let req = SendRequest {
                destination: out.unwrap_or_else(|| {
                    send_destination(&file, config.transfer.output_dir.as_deref())
                }),
                source: file,
                name,
                public_key,
                private_key: SecretHex::new(private_key),
                sender,
                recipient,
                price,
            };
            cmd_send(&config, req, &cancel).await
        }
        Commands::Receive {
            file,
            out,
            on_conflict,
        } => {
            let req = ReceiveRequest {
                destination: out.unwrap_or_else(|| {
                    receive_destination(&file, config.transfer.output_dir.as_deref())
                }),
                source: file,
            };
            cmd_receive(&config, req, on_conflict, &cancel).await
        }
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Store from config + environment credentials ───────────────────────────────

/// Build the record store. S3 credentials come from AWS_ACCESS_KEY_ID and
/// AWS_SECRET_ACCESS_KEY (or the CDROP_ prefixed variants).
fn build_store(config: &CdropConfig) -> Result<Arc<dyn RecordStore>> {
    let creds = if config.store.backend == "s3" {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .or_else(|_| std::env::var("CDROP_ACCESS_KEY_ID"))
            .context(
                "S3 credentials not set\n\
                 Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY environment variables.",
            )?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .or_else(|_| std::env::var("CDROP_SECRET_ACCESS_KEY"))
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        Some(S3Credentials {
            access_key_id,
            secret_access_key,
        })
    } else {
        None
    };

    let op = build_operator(&config.store, creds.as_ref()).context("building record store")?;
    Ok(Arc::new(OperatorStore::new(op, config.store.prefix.clone())))
}

fn build_protocol(config: &CdropConfig) -> Result<ContentAddressProtocol> {
    let runner = TaskRunner::from_config(&config.transfer);
    Ok(ContentAddressProtocol::new(runner, build_store(config)?))
}

// ── Output paths ──────────────────────────────────────────────────────────────

fn send_destination(source: &Path, output_dir: Option<&Path>) -> PathBuf {
    let mut name = source
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "file".into());
    name.push(".");
    name.push(CIPHERTEXT_EXT);
    place(source, output_dir, PathBuf::from(name))
}

fn receive_destination(source: &Path, output_dir: Option<&Path>) -> PathBuf {
    let name = match source.extension() {
        Some(ext) if ext == CIPHERTEXT_EXT => source.file_stem().map(PathBuf::from),
        _ => source.file_name().map(|n| {
            let mut n = n.to_os_string();
            n.push(".plain");
            PathBuf::from(n)
        }),
    }
    .unwrap_or_else(|| PathBuf::from("received"));
    place(source, output_dir, name)
}

fn place(source: &Path, output_dir: Option<&Path>, name: PathBuf) -> PathBuf {
    match output_dir {
        Some(dir) => expand_tilde(dir).join(name),
        None => source.with_file_name(name),
    }
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

const BAR_SCALE: u64 = 1000;

fn make_progress_bar(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(BAR_SCALE);
    let style = ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {percent:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn bar_progress(pb: &ProgressBar) -> ProgressFn {
    let pb = pb.clone();
    Box::new(move |state: &TransferState| {
        pb.set_position((state.progress * BAR_SCALE as f64) as u64);
        pb.set_message(state.stage.to_string());
    })
}

// ── `cdrop digest` ────────────────────────────────────────────────────────────

async fn cmd_digest(config: &CdropConfig, file: &Path, cancel: &CancellationToken) -> Result<()> {
    let runner = TaskRunner::from_config(&config.transfer);
    let pb = make_progress_bar("digest");
    let bar = pb.clone();
    let hash = runner
        .digest(file.to_path_buf(), cancel)
        .watch(move |fraction| bar.set_position((fraction * BAR_SCALE as f64) as u64))
        .await
        .with_context(|| format!("hashing {}", file.display()))?;
    pb.finish_and_clear();
    println!("{hash}  {}", file.display());
    Ok(())
}

// ── `cdrop keygen` ────────────────────────────────────────────────────────────

fn cmd_keygen() -> Result<()> {
    let key = cdrop_crypto::PrivateKey::generate();
    println!("public:  {}", key.public_key().to_hex());
    println!("private: {}", key.to_secret_hex().expose());
    Ok(())
}

// ── `cdrop send` ──────────────────────────────────────────────────────────────

async fn cmd_send(config: &CdropConfig, req: SendRequest, cancel: &CancellationToken) -> Result<()> {
    let protocol = build_protocol(config)?;
    let source = req.source.clone();
    println!(
        "Sending {} → {}",
        req.source.display(),
        req.destination.display()
    );

    let pb = make_progress_bar("send");
    let progress = bar_progress(&pb);
    let result = protocol.send(req, Some(&progress), cancel).await;
    pb.finish_and_clear();
    let sent = result.with_context(|| format!("sending {}", source.display()))?;

    let size = std::fs::metadata(&sent.state.destination)
        .map(|m| m.len())
        .unwrap_or_default();
    println!("  name:     {}", sent.record.name);
    println!("  hash:     {}", sent.record.hash.as_deref().unwrap_or("-"));
    println!("  address:  {}", sent.record.hash_ciphered);
    println!("  bytes:    {}", fmt_bytes(size));
    println!("  output:   {}", sent.state.destination.display());
    Ok(())
}

// ── `cdrop receive` ───────────────────────────────────────────────────────────

async fn cmd_receive(
    config: &CdropConfig,
    req: ReceiveRequest,
    on_conflict: OnConflict,
    cancel: &CancellationToken,
) -> Result<()> {
    let protocol = build_protocol(config)?;
    let source = req.source.clone();
    println!(
        "Receiving {} → {}",
        req.source.display(),
        req.destination.display()
    );

    let pb = make_progress_bar("receive");
    let progress = bar_progress(&pb);
    let result = protocol.receive(req, Some(&progress), cancel).await;
    pb.finish_and_clear();
    let outcome = result.with_context(|| format!("receiving {}", source.display()))?;

    match outcome {
        ReceiveOutcome::Verified(file) => {
            println!("  name:     {}", file.record.name);
            println!("  hash:     {} (verified)", file.record.hash.as_deref().unwrap_or("-"));
            println!("  output:   {}", file.state.destination.display());
            Ok(())
        }
        ReceiveOutcome::Conflict(conflict) => {
            let error = conflict.to_error();
            eprintln!("warning: {error}");
            let choice = match on_conflict {
                OnConflict::Keep => ConflictResolution::Keep,
                OnConflict::Discard => ConflictResolution::Discard,
                OnConflict::Ask => {
                    let destination = conflict.destination().to_path_buf();
                    tokio::task::spawn_blocking(move || ask_keep(&destination))
                        .await
                        .context("reading answer")??
                }
            };
            match conflict.resolve(choice).await? {
                Some(kept) => {
                    println!("  output:   {} (NOT verified)", kept.state.destination.display());
                    Ok(())
                }
                None => Err(anyhow::Error::new(error).context("decrypted file discarded")),
            }
        }
    }
}

fn ask_keep(destination: &Path) -> Result<ConflictResolution> {
    print!(
        "The record store did not confirm {}. Keep it anyway? [y/N] ",
        destination.display()
    );
    std::io::stdout().flush().context("flushing stdout")?;
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("reading stdin")?;
    Ok(parse_answer(&answer))
}

fn parse_answer(answer: &str) -> ConflictResolution {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "keep" => ConflictResolution::Keep,
        _ => ConflictResolution::Discard,
    }
}

// ── `cdrop config show` ───────────────────────────────────────────────────────

fn cmd_config_show(config: &CdropConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_send() {
        let cli = Cli::try_parse_from([
            "cdrop",
            "send",
            "notes.txt",
            "--public-key",
            "04ab",
            "--private-key",
            "01",
            "--price",
            "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Send { file, price, .. } => {
                assert_eq!(file, PathBuf::from("notes.txt"));
                assert_eq!(price, Some(5));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_receive_defaults_to_ask() {
        let cli = Cli::try_parse_from(["cdrop", "receive", "notes.txt.cdrop"]).unwrap();
        match cli.command {
            Commands::Receive { on_conflict, .. } => assert_eq!(on_conflict, OnConflict::Ask),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_destinations() {
        assert_eq!(
            send_destination(Path::new("/tmp/a/notes.txt"), None),
            PathBuf::from("/tmp/a/notes.txt.cdrop")
        );
        assert_eq!(
            receive_destination(Path::new("/tmp/a/notes.txt.cdrop"), None),
            PathBuf::from("/tmp/a/notes.txt")
        );
        assert_eq!(
            receive_destination(Path::new("/tmp/a/blob.bin"), Some(Path::new("/out"))),
            PathBuf::from("/out/blob.bin.plain")
        );
    }

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("y\n"), ConflictResolution::Keep);
        assert_eq!(parse_answer("YES"), ConflictResolution::Keep);
        assert_eq!(parse_answer("\n"), ConflictResolution::Discard);
        assert_eq!(parse_answer("no"), ConflictResolution::Discard);
    }

    #[test]
    fn test_fmt_bytes() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(2048), "2.0 KB");
        assert_eq!(fmt_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[tokio::test]
    async fn test_send_receive_with_fs_store() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = CdropConfig::default();
        config.store.root = tmp.path().join("store");

        let source = tmp.path().join("hello.txt");
        std::fs::write(&source, b"Hello world!").unwrap();
        let key = cdrop_crypto::PrivateKey::generate();
        let req = SendRequest {
            source: source.clone(),
            destination: send_destination(&source, None),
            name: None,
            public_key: key.public_key().to_hex(),
            private_key: key.to_secret_hex(),
            sender: None,
            recipient: None,
            price: None,
        };
        let cancel = CancellationToken::new();
        cmd_send(&config, req, &cancel).await.unwrap();

        let ciphertext = tmp.path().join("hello.txt.cdrop");
        let out = tmp.path().join("roundtrip.txt");
        cmd_receive(
            &config,
            ReceiveRequest {
                source: ciphertext,
                destination: out.clone(),
            },
            OnConflict::Discard,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read(out).unwrap(), b"Hello world!");
    }
}
