// DANS : src/monitoring/metrics.rs

use lazy_static::lazy_static;
use prometheus::{
    Encoder, IntCounter, IntGauge, TextEncoder, register_int_counter, register_int_gauge,
};
use tracing::info;
use warp::Filter;

lazy_static! {
    // --- Comptes & Cycles ---
    pub static ref ACCOUNTS_PROCESSED: IntCounter = register_int_counter!(
        "questbot_accounts_processed_total", "Comptes dont le pipeline a terminé avec succès"
    ).unwrap();
    pub static ref ACCOUNTS_SKIPPED: IntCounter = register_int_counter!(
        "questbot_accounts_skipped_total", "Comptes abandonnés pour un cycle (erreur, panique ou timeout)"
    ).unwrap();
    pub static ref CYCLE_NUMBER: IntGauge = register_int_gauge!(
        "questbot_cycle_number", "Numéro du cycle en cours"
    ).unwrap();

    // --- Claims ---
    pub static ref CLAIMS_SUBMITTED: IntCounter = register_int_counter!(
        "questbot_claims_submitted_total", "Claims de tâches soumis au serveur"
    ).unwrap();
    pub static ref CLAIMS_SUCCEEDED: IntCounter = register_int_counter!(
        "questbot_claims_succeeded_total", "Claims acceptés par le serveur"
    ).unwrap();
    pub static ref CLAIMS_FAILED: IntCounter = register_int_counter!(
        "questbot_claims_failed_total", "Claims refusés ou en erreur"
    ).unwrap();

    // --- Santé HTTP ---
    pub static ref REQUEST_RETRIES: IntCounter = register_int_counter!(
        "questbot_request_retries_total", "Tentatives HTTP rejouées après un échec transitoire"
    ).unwrap();
    pub static ref RATE_LIMIT_HITS: IntCounter = register_int_counter!(
        "questbot_rate_limit_hits_total", "Réponses 429 reçues du serveur"
    ).unwrap();
    pub static ref TOKENS_REFRESHED: IntCounter = register_int_counter!(
        "questbot_tokens_refreshed_total", "Bearer tokens obtenus par authentification"
    ).unwrap();
}

pub async fn start_metrics_server(port: u16) {
    let metrics_route = warp::path!("metrics").map(|| {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&prometheus::gather(), &mut buffer).unwrap();
        warp::reply::with_header(buffer, "content-type", "text/plain; version=0.0.4")
    });
    info!("[Monitoring] Métriques exposées sur http://0.0.0.0:{port}/metrics");
    warp::serve(metrics_route).run(([0, 0, 0, 0], port)).await;
}
