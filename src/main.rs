use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use nntp_gate::{
    create_default_config, daemon, hash_password, load_config, tls, Config, ConnectionStream,
    NewUser, PasswordScheme, Proxy, QuotaStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short, long)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision a user record in the quota store
    AddUser {
        username: String,
        password: String,
        /// Concurrent frontend sessions allowed
        #[arg(long, default_value_t = 1)]
        max_conn: i64,
        /// Byte allowance per period (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        allowance: i64,
        /// Renewal period in months
        #[arg(long, default_value_t = 1)]
        period: i64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let num_cpus = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    let worker_threads = args.threads.unwrap_or(num_cpus);

    if worker_threads == 1 {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        rt.block_on(run(args))
    } else {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .enable_all()
            .build()?;
        rt.block_on(run(args))
    }
}

async fn run(args: Args) -> Result<()> {
    // Load configuration, creating a starter file on first run
    let config = if std::path::Path::new(&args.config).exists() {
        match load_config(&args.config) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load config file '{}': {}", args.config, e);
                return Err(e);
            }
        }
    } else {
        warn!("Config file '{}' not found, creating default config", args.config);
        let default_config = create_default_config();
        let config_toml = toml::to_string_pretty(&default_config)?;
        std::fs::write(&args.config, &config_toml)?;
        info!("Created default config file: {}", args.config);
        default_config
    };

    if let Some(Command::AddUser {
        username,
        password,
        max_conn,
        allowance,
        period,
    }) = args.command
    {
        return add_user(&config, &username, &password, max_conn, allowance, period).await;
    }

    info!(
        "Using backend '{}' ({}:{}, {})",
        config.backends[0].name,
        config.backends[0].addr,
        config.backends[0].port,
        if config.backends[0].tls_enabled {
            "tls"
        } else {
            "plaintext"
        }
    );

    let proxy = Arc::new(Proxy::new(config.clone()).await?);
    proxy.prewarm_connections().await;

    let acceptor = if config.frontend.tls_enabled {
        // validate() guarantees the paths are present
        let cert = config.frontend.tls_cert_path.as_deref().unwrap_or_default();
        let key = config.frontend.tls_key_path.as_deref().unwrap_or_default();
        Some(tls::server_acceptor(cert, key)?)
    } else {
        None
    };

    let listen_addr = format!("{}:{}", config.frontend.addr, config.frontend.port);
    let listener = TcpListener::bind(&listen_addr).await?;
    if acceptor.is_some() {
        info!("[TLS] NNTP proxy listening on {}", listen_addr);
    } else {
        info!(
            "[PLAIN - do not expose in production] NNTP proxy listening on {}",
            listen_addr
        );
    }

    daemon::notify_ready();
    daemon::spawn_watchdog();

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let proxy = proxy.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let stream = match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => ConnectionStream::tls_server(tls_stream),
                            Err(e) => {
                                warn!("TLS handshake with {} failed: {}", addr, e);
                                return;
                            }
                        },
                        None => ConnectionStream::plain(stream),
                    };
                    if let Err(e) = proxy.handle_client(stream, addr).await {
                        error!("Error handling client {}: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn add_user(
    config: &Config,
    username: &str,
    password: &str,
    max_conn: i64,
    allowance: i64,
    period: i64,
) -> Result<()> {
    let store = QuotaStore::new(&config.store.database_url).await?;
    let stored = match config.store.password_scheme {
        PasswordScheme::Plain => password.to_string(),
        PasswordScheme::Argon2 => hash_password(password)?,
    };
    let id = store
        .create_user(&NewUser {
            username,
            password: &stored,
            max_conn,
            allowance,
            period,
        })
        .await?;
    info!("created user '{}' (id {})", username, id);
    Ok(())
}
