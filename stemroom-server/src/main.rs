//! stemroom-server: realtime track rooms over WebSocket.
//!
//! ```text
//! stemroom-server serve --token-secret … [--data-dir ./data]
//! stemroom-server mint-token --token-secret … --sub 42 --username alice
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;

use stemroom_collab::server::{ObjectStorageConfig, ServerConfig, SyncServer};
use stemroom_core::token::{login_redirect, SESSION_TTL_SECS};
use stemroom_core::{unix_seconds, SessionClaims, TokenCodec, TokenSecret};

#[derive(Parser, Debug)]
#[command(name = "stemroom-server")]
#[command(about = "Realtime collaboration server for multitrack recordings")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sync server
    Serve(ServeArgs),
    /// Print a session token (development only)
    MintToken(MintArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090", env = "STEMROOM_BIND")]
    bind: String,

    /// Session token signing secret
    #[arg(long, env = "STEMROOM_TOKEN_SECRET", hide_env_values = true)]
    token_secret: String,

    /// Web application base URL
    #[arg(long, env = "STEMROOM_APP_URL")]
    app_url: Option<String>,

    /// RocksDB directory; rooms are kept in memory only when unset
    #[arg(long, env = "STEMROOM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 100)]
    max_peers_per_room: usize,

    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,

    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    #[command(flatten)]
    storage: StorageArgs,
}

/// Object storage for stem uploads.
#[derive(Args, Debug)]
struct StorageArgs {
    #[arg(long, env = "STEMROOM_STORAGE_ENDPOINT")]
    storage_endpoint: Option<String>,

    #[arg(long, env = "STEMROOM_STORAGE_BUCKET")]
    storage_bucket: Option<String>,

    #[arg(long, env = "STEMROOM_STORAGE_ACCESS_KEY")]
    storage_access_key: Option<String>,

    #[arg(long, env = "STEMROOM_STORAGE_SECRET_KEY", hide_env_values = true)]
    storage_secret_key: Option<String>,

    #[arg(long, env = "STEMROOM_STORAGE_PUBLIC_URL")]
    storage_public_url: Option<String>,
}

impl StorageArgs {
    /// All of endpoint, bucket and both keys, or nothing.
    fn into_config(self) -> Result<Option<ObjectStorageConfig>> {
        match (
            self.storage_endpoint,
            self.storage_bucket,
            self.storage_access_key,
            self.storage_secret_key,
        ) {
            (Some(endpoint), Some(bucket), Some(access_key_id), Some(secret_access_key)) => {
                Ok(Some(ObjectStorageConfig {
                    endpoint,
                    bucket,
                    access_key_id,
                    secret_access_key,
                    public_base_url: self.storage_public_url,
                }))
            }
            (None, None, None, None) => Ok(None),
            _ => anyhow::bail!(
                "object storage needs endpoint, bucket, access key and secret key together"
            ),
        }
    }
}

#[derive(Args, Debug)]
struct MintArgs {
    #[arg(long, env = "STEMROOM_TOKEN_SECRET", hide_env_values = true)]
    token_secret: String,

    /// Subject id
    #[arg(long)]
    sub: String,

    #[arg(long)]
    username: String,

    #[arg(long)]
    avatar: Option<String>,

    /// Lifetime in seconds
    #[arg(long, default_value_t = SESSION_TTL_SECS)]
    ttl: u64,

    /// Print the login redirect for this app instead of the bare token
    #[arg(long, env = "STEMROOM_APP_URL")]
    app_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::MintToken(args) => mint_token(args),
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = ServerConfig {
        bind_addr: args.bind,
        max_peers_per_room: args.max_peers_per_room,
        broadcast_capacity: args.broadcast_capacity,
        heartbeat_interval_secs: args.heartbeat_secs,
        storage_path: args.data_dir,
        token_secret: TokenSecret::new(&args.token_secret),
        app_url: args.app_url,
        object_storage: args.storage.into_config()?,
    };
    info!(
        "Starting stemroom on {} (storage: {}, uploads: {})",
        config.bind_addr,
        config
            .storage_path
            .as_ref()
            .map_or("memory".to_string(), |p| p.display().to_string()),
        if config.object_storage.is_some() { "enabled" } else { "disabled" }
    );

    let server = SyncServer::new(config).context("Failed to create sync server")?;

    tokio::select! {
        result = server.run() => result.context("Sync server stopped")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            let persisted = server
                .persist_all()
                .await
                .context("Failed to persist rooms on shutdown")?;
            info!("Persisted {persisted} rooms");
        }
    }
    Ok(())
}

fn mint_token(args: MintArgs) -> Result<()> {
    let codec = TokenCodec::new(TokenSecret::new(&args.token_secret));
    let mut claims = SessionClaims::new(args.sub, args.username, unix_seconds(), args.ttl);
    claims.avatar = args.avatar;
    let token = codec.issue(&claims).context("Failed to sign token")?;

    match args.app_url {
        Some(app_url) => println!("{}", login_redirect(&app_url, &token)),
        None => println!("{token}"),
    }
    Ok(())
}
