use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use companion_core::oneshot::find_protocol_url;
use companion_core::{
    CompanionConfig, ConsoleShell, DesktopShell, Dispatcher, OneShot, SessionServer, TrustStore,
};
use std::future::Future;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Parser)]
#[command(author, version, about = "Edit documents from a collaboration site in desktop applications", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve browser sessions over a local WebSocket
    Serve {
        /// Address to listen on (overrides the configured one)
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Edit a single file from an atlassian-companion: URL
    Open {
        /// The protocol URL passed by the browser
        url: Option<String>,
    },
    /// Manage trusted self-hosted sites
    Trust {
        #[command(subcommand)]
        action: TrustAction,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum TrustAction {
    /// List trusted sites
    List,
    /// Trust a site without being asked
    Add {
        /// Site title exactly as the site reports it
        site: String,
    },
}

/// Get the companion data directory
fn companion_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("COMPANION_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().ok_or_else(|| anyhow!("Could not determine home directory"))?;
    Ok(home.join(".companion"))
}

fn load_config() -> Result<CompanionConfig> {
    let dir = companion_dir()?;
    CompanionConfig::load_or_default(&dir)
        .with_context(|| format!("Failed to load configuration from {:?}", dir))
}

fn open_trust_store(config: &CompanionConfig) -> Result<TrustStore> {
    TrustStore::open_with_seed(config.trust_store_path(), &config.preapproved_sites)
        .context("Failed to open trust store")
}

// =============================================================================
// Serve
// =============================================================================

async fn cmd_serve(mut config: CompanionConfig, listen: Option<String>) -> Result<()> {
    if let Some(addr) = listen {
        config.listen_addr = addr;
    }
    config
        .ensure_directories()
        .context("Failed to create companion directories")?;

    let trust = open_trust_store(&config)?;
    let config = Arc::new(config);
    let shell: Arc<dyn DesktopShell> = Arc::new(ConsoleShell);
    let (mut dispatcher, mut changes) = Dispatcher::new(Arc::clone(&config), trust, shell)?;

    let shutdown = termination().context("Failed to install signal handlers")?;
    let server = SessionServer::bind_with_tls(&config.listen_addr, &config.tls)
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen_addr))?;

    println!(
        "Companion listening on {}://{}",
        server.scheme(),
        server.local_addr()?
    );
    println!("  Cache: {}", config.cache_dir.display());
    println!("Press Ctrl+C to stop.");

    server.run(&mut dispatcher, &mut changes, shutdown).await?;
    println!("Stopped.");
    Ok(())
}

// =============================================================================
// One-shot
// =============================================================================

async fn cmd_open(mut config: CompanionConfig, url: Option<String>) -> Result<()> {
    let url = url.ok_or_else(|| {
        anyhow!(
            "no valid '{}' scheme parameter given",
            config.protocol_scheme
        )
    })?;
    config
        .ensure_directories()
        .context("Failed to create companion directories")?;

    let shell: Arc<dyn DesktopShell> = Arc::new(ConsoleShell);
    let one_shot = OneShot::new(Arc::new(config), shell)?;

    let prepared = one_shot.prepare(&url).await?;
    println!("Editing {}", prepared.metadata.file_name);
    println!("  Local copy: {}", prepared.path.display());
    println!("Changes are uploaded on save. Press Enter to end editing.");

    let terminate = termination().context("Failed to install signal handlers")?;
    let summary = one_shot.watch(prepared, close_signal(terminate)).await?;
    println!(
        "Editing ended ({} upload(s), {} failed).",
        summary.uploads, summary.failures
    );
    Ok(())
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("cannot listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
}

/// Completes on Ctrl+C or SIGTERM. Handlers are installed before this
/// returns, so a signal sent right after startup is not missed.
#[cfg(unix)]
fn termination() -> io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = ctrl_c() => {}
            _ = terminate.recv() => log::info!("SIGTERM received"),
        }
    })
}

#[cfg(not(unix))]
fn termination() -> io::Result<impl Future<Output = ()>> {
    Ok(ctrl_c())
}

/// Completes on `terminate` or when Enter is pressed.
async fn close_signal(terminate: impl Future<Output = ()>) {
    let (tx, rx) = oneshot::channel();
    // Detached: a blocked stdin read must not hold up process exit.
    std::thread::spawn(move || {
        let mut line = String::new();
        if matches!(io::stdin().lock().read_line(&mut line), Ok(n) if n > 0) {
            let _ = tx.send(());
        }
    });

    let enter = async {
        if rx.await.is_err() {
            // stdin closed without a line; only the signals remain.
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = terminate => {}
        _ = enter => {}
    }
}

// =============================================================================
// Trust / Config
// =============================================================================

fn cmd_trust(config: &CompanionConfig, action: TrustAction) -> Result<()> {
    let mut store = open_trust_store(config)?;
    match action {
        TrustAction::List => {
            if store.sites().is_empty() {
                println!("No trusted sites.");
                println!();
                println!("Sites are added when you approve them, or with: companion trust add <site>");
                return Ok(());
            }
            println!("Trusted sites:");
            for site in store.sites() {
                println!("  {site}");
            }
        }
        TrustAction::Add { site } => {
            if store.append(&site)? {
                println!("Trusted site added: {site}");
            } else {
                println!("Site already trusted: {site}");
            }
        }
    }
    Ok(())
}

fn cmd_config(config: &CompanionConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = load_config()?;

    // Browsers invoke the handler with the protocol URL as a bare argument.
    if let Some(url) = find_protocol_url(std::env::args().skip(1), &config.protocol_scheme) {
        return cmd_open(config, Some(url)).await;
    }

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Serve { listen }) => {
            cmd_serve(config, listen).await?;
        }
        Some(Commands::Open { url }) => {
            cmd_open(config, url).await?;
        }
        Some(Commands::Trust { action }) => {
            cmd_trust(&config, action)?;
        }
        Some(Commands::Config) => {
            cmd_config(&config)?;
        }
        None => {
            cmd_open(config, None).await?;
        }
    }

    Ok(())
}
