// src/scheduler/mod.rs

// Le pool de workers borné et la boucle de cycles. Les pipelines d'un batch
// tournent chacun dans leur propre tâche tokio; le batch suivant ne démarre
// qu'une fois le batch courant complètement drainé.

use crate::api::QuestClient;
use crate::config::Config;
use crate::error::BotError;
use crate::monitoring::metrics;
use crate::pipeline::AccountPipeline;
use crate::session::AccountSession;
use crate::session::stores::{TokenStore, UserAgentStore};
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

/// Délai maximal accordé au pipeline d'un compte avant abandon.
const PIPELINE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
/// Pause entre deux batches consécutifs.
const BATCH_PAUSE: Duration = Duration::from_secs(3);

/// Issue d'un pipeline, consommée par le pool pour le journal et l'agrégat
/// d'erreurs du cycle. Jamais persistée.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub index: usize,
    pub success: bool,
    pub error: Option<String>,
}

/// Découpe `count` comptes en batches consécutifs de taille <= `limit` et
/// lance chaque pipeline dans sa propre tâche, bornée par `pipeline_timeout`.
/// Garanties: jamais plus de `limit` pipelines en vol, le batch N est drainé
/// avant le batch N+1, et l'échec (ou la panique) d'un compte n'empêche
/// jamais les autres de se terminer.
pub async fn run_batches<F, Fut>(
    count: usize,
    limit: usize,
    pipeline_timeout: Duration,
    make_pipeline: F,
) -> Vec<BatchResult>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let limit = limit.max(1);
    let mut results = Vec::with_capacity(count);
    let mut next = 0usize;
    while next < count {
        let batch_end = (next + limit).min(count);
        let mut handles = Vec::with_capacity(batch_end - next);
        for index in next..batch_end {
            let pipeline = make_pipeline(index);
            handles.push((
                index,
                tokio::spawn(async move { timeout(pipeline_timeout, pipeline).await }),
            ));
        }
        for (index, handle) in handles {
            let result = match handle.await {
                Ok(Ok(Ok(()))) => BatchResult {
                    index,
                    success: true,
                    error: None,
                },
                Ok(Ok(Err(e))) => BatchResult {
                    index,
                    success: false,
                    error: Some(format!("{e:#}")),
                },
                Ok(Err(_elapsed)) => BatchResult {
                    index,
                    success: false,
                    error: Some(BotError::Timeout(pipeline_timeout.as_secs()).to_string()),
                },
                // La tâche a paniqué: absorbé ici, le batch continue.
                Err(join_error) => BatchResult {
                    index,
                    success: false,
                    error: Some(format!("tâche interrompue: {join_error}")),
                },
            };
            results.push(result);
        }
        next = batch_end;
        if next < count {
            sleep(BATCH_PAUSE).await;
        }
    }
    results
}

/// Orchestration complète: inventaire des comptes, pool borné, cycles sans
/// fin. Les magasins durables sont injectés et partagés par tous les
/// pipelines.
pub struct Scheduler {
    config: Arc<Config>,
    keys: Vec<String>,
    proxies: Vec<String>,
    token_store: Arc<TokenStore>,
    ua_store: Arc<UserAgentStore>,
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        keys: Vec<String>,
        proxies: Vec<String>,
        token_store: Arc<TokenStore>,
        ua_store: Arc<UserAgentStore>,
    ) -> Result<Self> {
        config.validate_inventory(keys.len(), proxies.len())?;
        Ok(Self {
            config,
            keys,
            proxies,
            token_store,
            ua_store,
        })
    }

    fn proxy_for(&self, index: usize) -> Option<String> {
        if self.proxies.is_empty() {
            None
        } else {
            Some(self.proxies[index % self.proxies.len()].clone())
        }
    }

    /// Passe d'amorçage, avant le premier cycle: fixe l'user agent de chaque
    /// compte pour que session_user_agents.json soit peuplé de façon stable,
    /// quel que soit l'ordre d'exécution ensuite. Aucun appel réseau.
    pub async fn prime_user_agents(&self) -> Result<()> {
        for (index, key) in self.keys.iter().enumerate() {
            let mut session = AccountSession::new(
                key,
                index,
                self.proxy_for(index),
                self.token_store.clone(),
                self.ua_store.clone(),
            )?;
            session.resolve_identity().await?;
        }
        Ok(())
    }

    /// Un cycle: recharge le cache de tokens puis traite tous les comptes en
    /// batches bornés. Chaque compte reçoit une session neuve; le scheduler
    /// ne lance jamais deux pipelines pour le même compte.
    pub async fn run_cycle(&self) -> Vec<BatchResult> {
        if let Err(e) = self.token_store.reload() {
            warn!("[Scheduler] Rechargement du cache de tokens impossible: {e:#}");
        }
        run_batches(
            self.keys.len(),
            self.config.concurrency(),
            PIPELINE_TIMEOUT,
            |index| {
                let config = self.config.clone();
                let key = self.keys[index].clone();
                let proxy = self.proxy_for(index);
                let token_store = self.token_store.clone();
                let ua_store = self.ua_store.clone();
                async move {
                    let session = AccountSession::new(&key, index, proxy, token_store, ua_store)?;
                    let client = QuestClient::new(session, config.clone())?;
                    AccountPipeline::new(client, config).run().await
                }
            },
        )
        .await
    }

    /// Boucle sans fin: un cycle complet, le journal des échecs, puis le
    /// sommeil inter-cycle. Ne se termine que sur erreur d'amorçage ou
    /// arrêt du process.
    pub async fn run_forever(&self) -> Result<()> {
        info!(
            "[Scheduler] Amorçage des user agents de {} comptes",
            self.keys.len()
        );
        self.prime_user_agents().await?;

        let mut cycle: u64 = 0;
        loop {
            cycle += 1;
            metrics::CYCLE_NUMBER.set(cycle as i64);
            info!(
                cycle,
                "[Scheduler] Démarrage du cycle | {} comptes | batches de {}",
                self.keys.len(),
                self.config.concurrency()
            );

            let results = self.run_cycle().await;
            let mut failures = 0usize;
            for result in &results {
                if let Some(reason) = &result.error {
                    failures += 1;
                    error!(
                        account = result.index + 1,
                        "[Scheduler] Compte abandonné pour ce cycle: {reason}"
                    );
                }
            }
            metrics::ACCOUNTS_PROCESSED.inc_by((results.len() - failures) as u64);
            metrics::ACCOUNTS_SKIPPED.inc_by(failures as u64);

            info!(
                cycle,
                failures,
                "[Scheduler] Cycle terminé | pause de {} minutes",
                self.config.cycle_sleep_minutes
            );
            sleep(Duration::from_secs(self.config.cycle_sleep_minutes * 60)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Compteur de concurrence avec high-water mark.
    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }
        fn leave(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn batch_width_never_exceeds_the_limit() {
        let gauge = Arc::new(Gauge::default());
        let results = run_batches(10, 3, Duration::from_secs(60), |_index| {
            let gauge = gauge.clone();
            async move {
                gauge.enter();
                sleep(Duration::from_millis(50)).await;
                gauge.leave();
                Ok(())
            }
        })
        .await;

        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 3);
        // Chaque compte apparaît exactement une fois: jamais deux pipelines
        // en vol pour le même index.
        let mut indices: Vec<usize> = results.iter().map(|r| r.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn one_panicking_account_does_not_stop_the_batch() {
        let completed = Arc::new(AtomicUsize::new(0));
        let results = run_batches(4, 4, Duration::from_secs(60), |index| {
            let completed = completed.clone();
            async move {
                if index == 2 {
                    panic!("compte piégé");
                }
                sleep(Duration::from_millis(10)).await;
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(completed.load(Ordering::SeqCst), 3);
        let failures: Vec<&BatchResult> = results.iter().filter(|r| !r.success).collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].index, 2);
        assert!(failures[0].error.as_deref().unwrap().contains("interrompue"));
    }

    #[tokio::test(start_paused = true)]
    async fn next_batch_waits_for_full_drain() {
        // Timestamps (en ms depuis le départ) de début et de fin par compte.
        let t0 = tokio::time::Instant::now();
        let events = Arc::new(tokio::sync::Mutex::new(Vec::<(usize, u64, u64)>::new()));
        run_batches(4, 2, Duration::from_secs(60), |index| {
            let events = events.clone();
            async move {
                let started = t0.elapsed().as_millis() as u64;
                // Le premier compte du batch traîne volontairement.
                let work = if index % 2 == 0 { 100 } else { 10 };
                sleep(Duration::from_millis(work)).await;
                events
                    .lock()
                    .await
                    .push((index, started, t0.elapsed().as_millis() as u64));
                Ok(())
            }
        })
        .await;

        let events = events.lock().await;
        let batch1_end = events
            .iter()
            .filter(|(i, _, _)| *i < 2)
            .map(|(_, _, end)| *end)
            .max()
            .unwrap();
        let batch2_start = events
            .iter()
            .filter(|(i, _, _)| *i >= 2)
            .map(|(_, start, _)| *start)
            .min()
            .unwrap();
        assert!(
            batch2_start >= batch1_end,
            "le batch 2 a démarré à {batch2_start}ms avant la fin du batch 1 à {batch1_end}ms"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_pipeline_is_abandoned_on_timeout() {
        let results = run_batches(2, 2, Duration::from_millis(100), |index| async move {
            if index == 0 {
                sleep(Duration::from_secs(3600)).await;
            }
            Ok(())
        })
        .await;

        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("abandonné"));
        assert!(results[1].success);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_collected_not_propagated() {
        let results = run_batches(3, 1, Duration::from_secs(60), |index| async move {
            if index == 1 {
                anyhow::bail!("proxy injoignable")
            }
            Ok(())
        })
        .await;

        assert_eq!(results.iter().filter(|r| !r.success).count(), 1);
        assert_eq!(
            results[1].error.as_deref(),
            Some("proxy injoignable")
        );
    }
}
