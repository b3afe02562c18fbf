use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use listenledger::http;
use listenledger_core::{AppConfig, PlayLedger, TrackCatalog};
use listenledger_engine::{
    PollSessionTracker, PushIngestor, RecentlyPlayedFetcher, Scheduler, SchedulerTiming,
    SessionPolicy,
};
use listenledger_providers::{SpotifyClient, SubsonicClient};
use listenledger_storage::{accounts, SqliteLedger};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "listenledger",
    about = "Now playing, pushed listens and recently played -> one play ledger"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run,
    Status,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    User {
        #[command(subcommand)]
        action: UserAction,
    },
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },
    Spotify {
        #[command(subcommand)]
        action: SpotifyAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Init,
}

#[derive(Subcommand, Debug)]
enum UserAction {
    /// Creates a user and prints its listen token.
    Add { name: String },
}

#[derive(Subcommand, Debug)]
enum ServerAction {
    Add {
        #[arg(long)]
        user: String,
        #[arg(long)]
        url: String,
        /// Defaults to the local username.
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: String,
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SpotifyAction {
    Link {
        #[arg(long)]
        user: String,
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        refresh_token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cmd = cli.command.unwrap_or(Commands::Run);
    let cfg_path = cli.config.unwrap_or_else(default_config_path);

    if let Commands::Config {
        action: ConfigAction::Init,
    } = cmd
    {
        init_config(&cfg_path)?;
        println!("Initialized config at {}", cfg_path.display());
        return Ok(());
    }

    let cfg = load_or_default(&cfg_path)?;
    init_logging(&cfg.log_level);

    match cmd {
        Commands::Run => run(cfg).await,
        Commands::Status => status(&cfg).await,
        Commands::User {
            action: UserAction::Add { name },
        } => add_user(&cfg, &name).await,
        Commands::Server {
            action:
                ServerAction::Add {
                    user,
                    url,
                    username,
                    password,
                    name,
                },
        } => {
            let ledger = open_ledger(&cfg).await?;
            let owner = find_user(&ledger, &user).await?;
            let id = accounts::add_subsonic_server(
                ledger.pool(),
                owner,
                name.as_deref(),
                &url,
                username.as_deref(),
                &password,
            )
            .await?;
            println!("Added server {id} for {user}");
            if cfg.subsonic.is_scrobble_only(&url) {
                println!("note: {url} is scrobble-only and will not be polled");
            }
            Ok(())
        }
        Commands::Spotify {
            action:
                SpotifyAction::Link {
                    user,
                    access_token,
                    refresh_token,
                },
        } => {
            let ledger = open_ledger(&cfg).await?;
            let owner = find_user(&ledger, &user).await?;
            accounts::store_spotify_tokens(
                ledger.pool(),
                owner,
                &access_token,
                refresh_token.as_deref(),
            )
            .await?;
            println!("Linked Spotify account for {user}");
            Ok(())
        }
        Commands::Config { .. } => Ok(()),
    }
}

async fn run(cfg: AppConfig) -> Result<()> {
    let ledger = Arc::new(open_ledger(&cfg).await?);

    let subsonic = SubsonicClient::new(&cfg.subsonic).context("failed to build subsonic client")?;
    let tracker = Arc::new(PollSessionTracker::new(
        Arc::new(subsonic),
        ledger.clone(),
        ledger.clone(),
        SessionPolicy::from_app_config(&cfg),
    ));
    let ingestor = Arc::new(
        PushIngestor::new(
            ledger.clone(),
            ledger.clone(),
            ledger.clone(),
            Duration::from_secs(cfg.ingest.now_playing_ttl_secs),
        )
        .with_poll_sessions(tracker.clone()),
    );

    let mut scheduler = Scheduler::new(
        ledger.clone(),
        tracker,
        cfg.subsonic.clone(),
        SchedulerTiming::from_app_config(&cfg),
        cfg.concurrency.max_in_flight,
    )
    .with_ingestor(ingestor.clone());

    if cfg.spotify.has_client_credentials() {
        let spotify = SpotifyClient::new(&cfg.spotify).context("failed to build spotify client")?;
        let fetcher = RecentlyPlayedFetcher::new(
            Arc::new(spotify),
            ledger.clone(),
            ledger.clone(),
            ledger.clone(),
            cfg.spotify.recently_played_limit,
        );
        scheduler = scheduler.with_fetcher(Arc::new(fetcher));
    } else {
        info!("spotify client credentials not configured; recently-played fetch disabled");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let listener = tokio::net::TcpListener::bind(&cfg.http.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http.listen_addr))?;
    info!(addr = %cfg.http.listen_addr, database = %cfg.database.url, "listenledger started");

    let mut http_shutdown = shutdown_rx;
    let mut server = tokio::spawn(async move {
        axum::serve(listener, http::router(ingestor))
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.changed().await;
            })
            .await
    });

    let served = tokio::select! {
        res = &mut server => Some(res),
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c; shutting down");
            None
        }
    };

    let _ = shutdown_tx.send(true);
    let served = match served {
        Some(res) => res,
        None => server.await,
    };
    if let Err(err) = scheduler_task.await {
        error!(error = %err, "scheduler task ended abnormally");
    }

    served
        .context("http server task panicked")?
        .context("http server failed")?;
    Ok(())
}

async fn status(cfg: &AppConfig) -> Result<()> {
    let ledger = open_ledger(cfg).await?;

    let users = accounts::list_users(ledger.pool()).await?;
    let targets = accounts::subsonic_targets(ledger.pool()).await?;
    let links = accounts::spotify_links(ledger.pool()).await?;

    println!("database: {}", cfg.database.url);
    println!("users: {}", users.len());
    for target in &targets {
        let mode = if cfg.subsonic.is_scrobble_only(&target.base_url) {
            "scrobble-only"
        } else {
            "polled"
        };
        println!(
            "server {}: user {} -> {} ({}, {mode})",
            target.server_id,
            target.user_id,
            target.name.as_deref().unwrap_or("<unnamed>"),
            target.base_url
        );
    }
    println!("spotify links: {}", links.len());

    for user in &users {
        let plays = ledger.recent_plays(user.id, 5).await?;
        if plays.is_empty() {
            println!("{}: no plays", user.username);
            continue;
        }
        println!("{}:", user.username);
        for play in plays {
            let label = match ledger.get_track(play.track_id).await? {
                Some(track) => format!("{} - {}", track.fields.artist, track.fields.title),
                None => format!("track {}", play.track_id),
            };
            println!(
                "  {} [{}] {} ({}s)",
                play.played_at,
                play.source,
                label,
                play.listened_duration_ms / 1000
            );
        }
    }

    Ok(())
}

async fn add_user(cfg: &AppConfig, name: &str) -> Result<()> {
    let ledger = open_ledger(cfg).await?;
    if accounts::user_by_name(ledger.pool(), name).await?.is_some() {
        bail!("user {name} already exists");
    }
    let token = uuid::Uuid::new_v4().simple().to_string();
    let user = accounts::create_user(ledger.pool(), name, &token).await?;
    println!("Created user {} (id {})", user.username, user.id);
    println!("listen token: {token}");
    Ok(())
}

async fn open_ledger(cfg: &AppConfig) -> Result<SqliteLedger> {
    SqliteLedger::open(&cfg.database.url, &cfg.catalog)
        .await
        .with_context(|| format!("failed to open database {}", cfg.database.url))
}

async fn find_user(ledger: &SqliteLedger, name: &str) -> Result<i64> {
    match accounts::user_by_name(ledger.pool(), name).await? {
        Some(user) => Ok(user.id),
        None => bail!("unknown user {name}"),
    }
}

fn default_config_path() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("listenledger").join("config.toml")
}

fn init_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    }
    let cfg = AppConfig::default();
    let toml = toml::to_string_pretty(&cfg)?;
    std::fs::write(path, toml)
        .with_context(|| format!("failed to write config file {}", path.display()))?;
    Ok(())
}

fn load_or_default(path: &Path) -> Result<AppConfig> {
    let mut cfg = if !path.exists() {
        AppConfig::default()
    } else {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))?
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

fn init_logging(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}

fn apply_env_overrides(cfg: &mut AppConfig) {
    let overrides: [(&str, &mut String); 5] = [
        ("LISTENLEDGER_LOG_LEVEL", &mut cfg.log_level),
        ("LISTENLEDGER_DATABASE_URL", &mut cfg.database.url),
        ("LISTENLEDGER_LISTEN_ADDR", &mut cfg.http.listen_addr),
        ("SPOTIFY_CLIENT_ID", &mut cfg.spotify.client_id),
        ("SPOTIFY_CLIENT_SECRET", &mut cfg.spotify.client_secret),
    ];
    for (key, slot) in overrides {
        if let Ok(v) = std::env::var(key) {
            if !v.trim().is_empty() {
                *slot = v;
            }
        }
    }
}
