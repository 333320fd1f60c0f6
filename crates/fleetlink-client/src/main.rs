//! Fleetlink endpoint binary.
//!
//! # Usage
//!
//! ```bash
//! # Create the endpoint key
//! fleetlink keygen --out endpoint.pem
//!
//! # Stream stdin lines to the server as log messages
//! fleetlink run --key endpoint.pem --server https://fleet.example:8000/ \
//!     --buffer /var/lib/fleetlink/buffer
//!
//! # Inspect a buffer file
//! fleetlink queue-stats --buffer /var/lib/fleetlink/buffer
//! ```

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand};
use fleetlink_client::{
    ChannelExecutor, ClientConfig, Communicator, HttpConnector, KillSwitch, LocalBufferConfig,
    SystemEnv, TransportConfig,
};
use fleetlink_crypto::{
    CryptoManager, DirectoryResolver, EnvRng, InMemoryResolver, KeyMaterial,
    PublicKeyResolver,
};
use fleetlink_proto::{Message, MessagePayload};
use fleetlink_queue::{DurableQueue, FileQueue};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Fleetlink endpoint
#[derive(Parser, Debug)]
#[command(name = "fleetlink")]
#[command(about = "Secure, crash-safe endpoint messaging")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate an endpoint key
    Keygen {
        /// Where to write the PEM private key
        #[arg(short, long)]
        out: PathBuf,

        /// RSA modulus size
        #[arg(long, default_value = "2048")]
        bits: usize,
    },

    /// Print the identity of a key
    Identity {
        /// PEM private key
        #[arg(short, long)]
        key: PathBuf,
    },

    /// Print a buffer file's statistics as JSON
    QueueStats {
        /// Buffer file
        #[arg(short, long)]
        buffer: PathBuf,

        /// Buffer capacity in bytes
        #[arg(long, default_value = "1073741824")]
        size: u64,
    },

    /// Send stdin lines to the server as log messages
    Run {
        /// PEM private key
        #[arg(short, long)]
        key: PathBuf,

        /// Server base URL (repeat for rotation)
        #[arg(short, long = "server", required = true)]
        servers: Vec<String>,

        /// Buffer file; omit for a memory buffer
        #[arg(short, long)]
        buffer: Option<PathBuf>,

        /// Delete the buffer file on exit instead of replaying it next start
        #[arg(long)]
        ephemeral_buffer: bool,

        /// Required server identity
        #[arg(long)]
        pinned_server_name: Option<String>,

        /// Directory of trusted peer keys; omit to trust only fetched server keys
        #[arg(long)]
        trust_dir: Option<PathBuf>,

        /// Upload budget per exchange in bytes
        #[arg(long, default_value_t = fleetlink_client::DEFAULT_MAX_UPLOAD_SIZE)]
        max_upload_size: u64,

        /// HTTP request timeout in seconds
        #[arg(long, default_value = "300")]
        timeout_secs: u64,

        /// Session id attached to outbound log messages
        #[arg(long, default_value = "F.stdin")]
        session: String,

        /// Disable chunk compression
        #[arg(long)]
        no_compression: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer().with_writer(std::io::stderr)).with(filter).init();

    match args.command {
        Command::Keygen { out, bits } => keygen(&out, bits),
        Command::Identity { key } => {
            let key = load_key(&key)?;
            writeln!(std::io::stdout().lock(), "{}", key.identity())?;
            Ok(())
        },
        Command::QueueStats { buffer, size } => {
            let queue = FileQueue::open(&buffer, size)?;
            let stats = queue.stats();
            queue.close();
            let mut stdout = std::io::stdout().lock();
            serde_json::to_writer_pretty(&mut stdout, &stats)?;
            writeln!(stdout)?;
            Ok(())
        },
        Command::Run {
            key,
            servers,
            buffer,
            ephemeral_buffer,
            pinned_server_name,
            trust_dir,
            max_upload_size,
            timeout_secs,
            session,
            no_compression,
        } => {
            let config = ClientConfig {
                max_upload_size,
                compression: !no_compression,
                buffer: LocalBufferConfig {
                    filename: buffer,
                    persistent: !ephemeral_buffer,
                    ..LocalBufferConfig::default()
                },
                transport: TransportConfig {
                    server_urls: servers,
                    pinned_server_name,
                    ..TransportConfig::default()
                },
                ..ClientConfig::default()
            };
            run(&key, trust_dir, config, Duration::from_secs(timeout_secs), session).await
        },
    }
}

fn keygen(out: &Path, bits: usize) -> Result<(), Box<dyn std::error::Error>> {
    let env = SystemEnv::new();
    let key = KeyMaterial::generate(&mut EnvRng(&env), bits)?;
    write_private_key(out, key.to_pem()?.as_bytes())?;
    tracing::info!(identity = %key.identity(), path = %out.display(), "wrote endpoint key");
    Ok(())
}

/// Writes a new private key file, readable by its owner only on unix.
///
/// Refuses to replace an existing file: truncating one would keep whatever
/// permissions it already had.
fn write_private_key(path: &Path, pem: &[u8]) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(pem)?;
    file.sync_all()
}

fn load_key(path: &Path) -> Result<KeyMaterial, Box<dyn std::error::Error>> {
    let pem = std::fs::read_to_string(path)?;
    Ok(KeyMaterial::from_pem(&pem)?)
}

async fn run(
    key: &Path,
    trust_dir: Option<PathBuf>,
    config: ClientConfig,
    timeout: Duration,
    session: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let env = SystemEnv::new();
    let local = load_key(key)?;
    let resolver: Arc<dyn PublicKeyResolver> = match trust_dir {
        Some(dir) => Arc::new(DirectoryResolver::open(dir)?),
        None => Arc::new(InMemoryResolver::new()),
    };
    let crypto = Arc::new(CryptoManager::new(env.clone(), local, resolver, config.crypto.clone()));
    let identity = crypto.identity().to_string();
    tracing::info!(%identity, "fleetlink endpoint starting");

    let connector = Arc::new(HttpConnector::new(timeout)?);
    let (executor, mut handle) = ChannelExecutor::new(256);

    let killed = Arc::new(tokio::sync::Notify::new());
    let on_kill: KillSwitch = {
        let killed = killed.clone();
        Arc::new(move || killed.notify_one())
    };

    let communicator =
        Communicator::start(env, &config, crypto, connector, Arc::new(executor), on_kill)?;

    let outbound = handle.outbound.clone();
    let source = identity.clone();
    let mut stdin_open = true;
    let mut stdin_done = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut request_id = 0;
        while let Ok(Some(line)) = lines.next_line().await {
            request_id += 1;
            let message = Message {
                session_id: session.clone(),
                request_id,
                source: source.clone(),
                urgent: false,
                payload: MessagePayload::Log { level: "INFO".to_string(), message: line },
            };
            if outbound.send(message).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            request = handle.requests.recv() => match request {
                Some(request) => tracing::info!(
                    session = %request.session_id,
                    kind = ?request.kind(),
                    "server request"
                ),
                None => break,
            },
            _ = &mut stdin_done, if stdin_open => {
                stdin_open = false;
                tracing::info!("stdin closed, running until interrupted");
            },
            () = killed.notified() => {
                tracing::warn!("exiting on server request");
                break;
            },
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("interrupted");
                break;
            },
        }
    }

    communicator.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_key_is_not_clobbered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("endpoint.pem");

        write_private_key(&path, b"first").unwrap();
        let err = write_private_key(&path, b"second").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&path).unwrap(), b"first");
    }

    #[cfg(unix)]
    #[test]
    fn private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("endpoint.pem");
        write_private_key(&path, b"pem").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
