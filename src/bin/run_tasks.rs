use anyhow::{Context, Result};
use clap::Parser;
use questbot::{
    config::Config,
    monitoring::{logging, metrics},
    scheduler::Scheduler,
    session::stores::JsonStore,
    wallets,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Fichiers durables, relus et réécrits à chaque cycle.
const TOKENS_FILE: &str = "tokens.json";
const USER_AGENTS_FILE: &str = "session_user_agents.json";

#[derive(Parser, Debug)]
#[command(author, version, about = "Traitement multi-comptes de la plateforme de quêtes", long_about = None)]
struct Cli {
    /// Fichier des clés privées, une par ligne.
    #[arg(long, default_value = "privateKeys.txt")]
    keys: PathBuf,
    /// Fichier des proxies, un URI par ligne, assignés aux comptes par index.
    #[arg(long, default_value = "proxies.txt")]
    proxies: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::setup_logging();
    let cli = Cli::parse();
    let config = Arc::new(Config::load()?);

    let keys = wallets::load_private_keys(&cli.keys)?;
    let proxies = if cli.proxies.exists() {
        wallets::load_proxies(&cli.proxies)?
    } else {
        Vec::new()
    };
    info!(
        "[Main] {} comptes chargés | {} proxies | mode proxy: {}",
        keys.len(),
        proxies.len(),
        config.use_proxy
    );
    if !config.use_proxy {
        warn!("[Main] Exécution sans proxy: tous les comptes sortent par la même IP");
    }

    // L'API doit répondre avant de lancer le moindre worker.
    if let Err(e) = probe_endpoint(&config.base_url).await {
        error!("[Main] API injoignable ({}): {e:#}", config.base_url);
        std::process::exit(1);
    }

    tokio::spawn(metrics::start_metrics_server(config.metrics_port));

    let token_store = Arc::new(JsonStore::open(TOKENS_FILE)?);
    let ua_store = Arc::new(JsonStore::open(USER_AGENTS_FILE)?);

    let scheduler = match Scheduler::new(config, keys, proxies, token_store, ua_store) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            // Inventaire incohérent: refus de démarrage, code de sortie non nul.
            error!("[Main] {e:#}");
            std::process::exit(1);
        }
    };
    scheduler.run_forever().await
}

/// Sonde légère de joignabilité, avant le premier cycle. Un statut d'erreur
/// HTTP suffit (l'API répond), seule une panne de transport est bloquante.
async fn probe_endpoint(base_url: &str) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let response = client
        .head(base_url)
        .send()
        .await
        .context("requête de sonde")?;
    info!("[Main] API joignable (statut {})", response.status());
    Ok(())
}
