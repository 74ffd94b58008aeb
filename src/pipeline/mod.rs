// src/pipeline/mod.rs

// La machine à états séquentielle d'un compte:
// Init -> Authenticated -> Synced -> TasksClaimed -> Done.
// Toute erreur retournée vaut "Skipped": le compte est abandonné pour le
// cycle courant et le batch continue sans lui.

use crate::api::QuestClient;
use crate::api::types::{AccountStats, Campaign, CampaignDetail, ChainTransaction, Profile, Quest, TransactionPage};
use crate::config::Config;
use crate::monitoring::metrics;
use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Pause entre deux soumissions de claim d'un même compte.
const CLAIM_PAUSE_SECS: u64 = 1;

pub struct AccountPipeline {
    client: QuestClient,
    config: Arc<Config>,
}

impl AccountPipeline {
    pub fn new(client: QuestClient, config: Arc<Config>) -> Self {
        Self { client, config }
    }

    pub async fn run(mut self) -> Result<()> {
        let account = self.client.session.index + 1;

        // Init: identité stable + token éventuel du cache.
        self.client.session.resolve_identity().await?;
        self.client.session.load_cached_token();

        // Point de sortie réseau, puis départ décalé pour étaler la charge.
        if self.config.use_proxy {
            let ip = self
                .client
                .check_proxy_ip()
                .await
                .map_err(|e| anyhow!("IP de sortie irrésolue: {e:#}"))?;
            let stagger = stagger_secs(self.config.stagger_min_secs, self.config.stagger_max_secs);
            info!(account, ip = %ip, "[Pipeline] Départ dans {stagger}s");
            sleep(Duration::from_secs(stagger)).await;
        }

        // Authenticated.
        let token = self.client.valid_token(false).await?;
        if token.is_none() {
            return Err(anyhow!("le serveur a refusé l'authentification"));
        }

        // Synced.
        self.sync_profile().await?;

        // TasksClaimed.
        self.handle_tasks().await?;

        info!(account, address = %self.client.session.address, "[Pipeline] Compte traité");
        Ok(())
    }

    /// Synchronise profil et stats. Le profil a droit à UNE relance (sauf
    /// rejet ferme du serveur); sans ces données le compte est sauté.
    async fn sync_profile(&mut self) -> Result<()> {
        let account = self.client.session.index + 1;

        let mut profile_res = self.client.get_profile().await;
        if !profile_res.success && profile_res.status != Some(400) {
            profile_res = self.client.get_profile().await;
        }
        let stats_res = self.client.get_stats().await;
        if !(profile_res.success && stats_res.success) {
            return Err(anyhow!("synchronisation profil/stats impossible"));
        }

        let profile: Profile = profile_res.json()?;
        let stats: AccountStats = stats_res.json()?;
        info!(
            account,
            "[Pipeline] {} | streak {} | rang {} | saison {}: {} pts | total {} pts",
            profile.username.as_deref().unwrap_or("(sans pseudo)"),
            stats.streak_count.unwrap_or(0),
            stats.rank.map_or_else(|| "-".to_string(), |r| r.to_string()),
            stats.season_id.unwrap_or(0),
            stats.total_points.unwrap_or(0.0),
            stats.final_points.unwrap_or(0.0),
        );

        // Rattachement au code de parrainage configuré, best-effort.
        if !self.config.ref_code.is_empty()
            && profile.referral_code.as_deref() != Some(self.config.ref_code.as_str())
        {
            let response = self.client.add_referral().await;
            if response.success {
                let referrals = self.client.get_referral_stats().await;
                if let Some(data) = referrals.data {
                    info!(account, "[Pipeline] Parrainage rattaché | stats: {data}");
                }
            } else {
                warn!(
                    account,
                    "[Pipeline] Inscription du parrainage refusée: {}",
                    response.error.as_deref().unwrap_or("raison inconnue")
                );
            }
        }
        Ok(())
    }

    /// Énumère les quêtes éligibles des campagnes autorisées et soumet les
    /// claims. Chaque claim est indépendant: un refus n'interrompt pas les
    /// suivants.
    async fn handle_tasks(&mut self) -> Result<()> {
        let account = self.client.session.index + 1;

        // L'historique sert de preuve pour les tâches tx-hash; son absence
        // n'empêche pas les autres claims.
        let tx_res = self.client.get_transactions().await;
        let transactions: Vec<ChainTransaction> = if tx_res.success {
            tx_res
                .json::<TransactionPage>()
                .map(|page| page.items)
                .unwrap_or_default()
                .into_iter()
                .filter(ChainTransaction::is_success)
                .collect()
        } else {
            warn!(account, "[Pipeline] Historique de transactions indisponible");
            Vec::new()
        };

        let campaigns_res = self.client.get_campaigns().await;
        if !campaigns_res.success {
            return Err(anyhow!("liste des campagnes indisponible"));
        }
        let campaigns: Vec<Campaign> = campaigns_res.json()?;
        let campaigns: Vec<Campaign> = campaigns
            .into_iter()
            .filter(|c| self.config.campaigns.contains(&c.id) && c.status == "OPEN")
            .collect();
        if campaigns.is_empty() {
            info!(account, "[Pipeline] Aucune campagne ouverte dans la liste autorisée");
            return Ok(());
        }

        let mut quests: Vec<Quest> = Vec::new();
        for campaign in &campaigns {
            info!(account, "[Pipeline] Inspection de la campagne {}", campaign.name);
            let detail_res = self.client.get_campaign_detail(campaign.id).await;
            if !detail_res.success {
                continue;
            }
            match detail_res.json::<CampaignDetail>() {
                Ok(detail) => quests.extend(detail.quests),
                Err(e) => warn!(account, "[Pipeline] Détail de campagne illisible: {e:#}"),
            }
        }

        quests.retain(|quest| {
            quest.status == "OPEN"
                && !quest.is_participated
                && !self.config.skip_tasks.contains(&quest.id)
        });
        if quests.is_empty() {
            info!(account, "[Pipeline] Aucune tâche disponible");
            return Ok(());
        }

        for quest in &quests {
            sleep(Duration::from_secs(CLAIM_PAUSE_SECS)).await;
            self.claim_quest(quest, &transactions).await;
        }
        Ok(())
    }

    async fn claim_quest(&mut self, quest: &Quest, transactions: &[ChainTransaction]) {
        let account = self.client.session.index + 1;
        info!(account, "[Pipeline] Tentative sur la tâche {} | {}", quest.id, quest.title);

        let (claim_type, payload) =
            build_claim_payload(quest, &self.client.session.address, transactions);
        if quest.quest_type.eq_ignore_ascii_case("TX_HASH") && payload["txHash"].is_null() {
            // Le serveur reste décisionnaire: on soumet quand même, sans hash.
            warn!(
                account,
                "[Pipeline] Aucune transaction trouvée pour {} ({})", quest.title, quest.id
            );
        }

        metrics::CLAIMS_SUBMITTED.inc();
        let response = if quest.campaign_id == self.config.social_campaign_id {
            self.client.claim_social(&payload, &claim_type).await
        } else {
            self.client.claim_onchain(&payload, &claim_type).await
        };
        if response.success {
            metrics::CLAIMS_SUCCEEDED.inc();
            info!(account, "[Pipeline] Tâche {} validée", quest.id);
        } else {
            metrics::CLAIMS_FAILED.inc();
            warn!(
                account,
                "[Pipeline] Tâche {} refusée: {}",
                quest.id,
                response.error.as_deref().unwrap_or("raison inconnue")
            );
        }
    }
}

/// Tirage du départ décalé; tolère une plage dégénérée (min >= max).
fn stagger_secs(min: u64, max: u64) -> u64 {
    if min >= max { min } else { fastrand::u64(min..=max) }
}

/// Construit le couple (type de claim, payload). Les tâches `TX_HASH`
/// portent le hash de la transaction de preuve quand l'historique en
/// contient une; sinon le champ reste null et le claim part quand même.
pub fn build_claim_payload(
    quest: &Quest,
    address: &str,
    transactions: &[ChainTransaction],
) -> (String, serde_json::Value) {
    let claim_type = quest.quest_type.to_lowercase().replace('_', "-");
    let mut payload = serde_json::json!({ "questId": quest.id });
    if claim_type == "tx-hash" {
        let tx_hash = find_proof_transaction(&quest.title, address, transactions);
        payload["txHash"] = serde_json::json!(tx_hash);
    }
    (claim_type, payload)
}

/// Cherche la transaction de preuve d'une tâche `tx-hash`: un transfert
/// natif entrant ou sortant selon le sens annoncé par le titre.
pub fn find_proof_transaction(
    title: &str,
    address: &str,
    transactions: &[ChainTransaction],
) -> Option<String> {
    let title = title.to_lowercase();
    if title.contains("receive") {
        transactions
            .iter()
            .find(|tx| tx.is_coin_transfer() && tx.is_incoming_for(address))
            .map(|tx| tx.hash.clone())
    } else if title.contains("send") {
        transactions
            .iter()
            .find(|tx| tx.is_coin_transfer() && tx.is_outgoing_for(address))
            .map(|tx| tx.hash.clone())
    } else {
        None
    }
}
