use crate::error::BotError;
use anyhow::Result;
use serde::Deserialize;

/// Tous les réglages du bot, chargés depuis l'environnement (et un éventuel
/// fichier .env). Chaque champ a une valeur par défaut raisonnable: un
/// `.env` vide suffit pour démarrer sans proxy.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// API principale de la plateforme de quêtes.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// API v2 (explorateur de chaîne) pour l'historique des transactions.
    #[serde(default = "default_base_url_v2")]
    pub base_url_v2: String,

    /// Utiliser les proxies de proxies.txt comme point de sortie réseau.
    #[serde(default)]
    pub use_proxy: bool,
    /// Largeur de batch en mode proxy.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Largeur de batch sans proxy (plus prudent: une seule IP de sortie).
    #[serde(default = "default_max_workers_no_proxy")]
    pub max_workers_no_proxy: usize,

    /// Tentatives supplémentaires accordées à chaque requête après le
    /// premier échec.
    #[serde(default = "default_request_retries")]
    pub request_retries: u32,
    /// Pause entre deux tentatives d'une même requête (hors rate limit).
    #[serde(default = "default_delay_between_requests")]
    pub delay_between_requests_secs: u64,
    /// Attente complète imposée après un 429.
    #[serde(default = "default_rate_limit_cooldown")]
    pub rate_limit_cooldown_secs: u64,

    /// Sommeil entre deux cycles complets, en minutes.
    #[serde(default = "default_cycle_sleep")]
    pub cycle_sleep_minutes: u64,
    /// Départ décalé des comptes en mode proxy, borne basse (secondes).
    #[serde(default = "default_stagger_min")]
    pub stagger_min_secs: u64,
    /// Départ décalé des comptes en mode proxy, borne haute (secondes).
    #[serde(default = "default_stagger_max")]
    pub stagger_max_secs: u64,

    /// Campagnes autorisées (liste blanche d'ids, ex: CAMPAIGNS=7,8).
    #[serde(default)]
    pub campaigns: Vec<u64>,
    /// Tâches à ignorer quoi qu'il arrive (liste d'ids).
    #[serde(default)]
    pub skip_tasks: Vec<u64>,
    /// Campagne dont les claims passent par l'endpoint "social".
    #[serde(default = "default_social_campaign_id")]
    pub social_campaign_id: u64,
    /// Code de parrainage à rattacher aux comptes (vide = désactivé).
    #[serde(default)]
    pub ref_code: String,

    /// Port d'exposition des métriques Prometheus.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_base_url() -> String {
    "https://quest.somnia.network/api".to_string()
}
fn default_base_url_v2() -> String {
    "https://somnia.w3us.site/api/v2".to_string()
}
fn default_max_workers() -> usize {
    10
}
fn default_max_workers_no_proxy() -> usize {
    5
}
fn default_request_retries() -> u32 {
    2
}
fn default_delay_between_requests() -> u64 {
    3
}
fn default_rate_limit_cooldown() -> u64 {
    60
}
fn default_cycle_sleep() -> u64 {
    480
}
fn default_stagger_min() -> u64 {
    1
}
fn default_stagger_max() -> u64 {
    15
}
fn default_social_campaign_id() -> u64 {
    8
}
fn default_metrics_port() -> u16 {
    9100
}

impl Default for Config {
    fn default() -> Self {
        // envy ne passe jamais par ici: ce Default sert aux tests et aux
        // constructions programmatiques.
        serde_json::from_value(serde_json::json!({})).expect("defaults de Config")
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = envy::from_env::<Config>()?;
        Ok(config)
    }

    /// Largeur de batch effective selon le mode proxy.
    pub fn concurrency(&self) -> usize {
        let limit = if self.use_proxy {
            self.max_workers
        } else {
            self.max_workers_no_proxy
        };
        limit.max(1)
    }

    /// Refus de démarrage si l'inventaire est incohérent avec le mode proxy.
    pub fn validate_inventory(&self, wallet_count: usize, proxy_count: usize) -> Result<(), BotError> {
        if wallet_count == 0 {
            return Err(BotError::Config("aucune clé privée chargée".to_string()));
        }
        if self.use_proxy && proxy_count < wallet_count {
            return Err(BotError::Config(format!(
                "proxies insuffisants: {proxy_count} proxies pour {wallet_count} comptes"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_without_env() {
        let config = Config::default();
        assert_eq!(config.request_retries, 2);
        assert_eq!(config.social_campaign_id, 8);
        assert!(!config.use_proxy);
        assert!(config.campaigns.is_empty());
    }

    #[test]
    fn concurrency_follows_proxy_mode() {
        let mut config = Config::default();
        config.max_workers = 10;
        config.max_workers_no_proxy = 5;
        config.use_proxy = true;
        assert_eq!(config.concurrency(), 10);
        config.use_proxy = false;
        assert_eq!(config.concurrency(), 5);
        // Jamais zéro, même mal configuré.
        config.max_workers_no_proxy = 0;
        assert_eq!(config.concurrency(), 1);
    }

    #[test]
    fn inventory_mismatch_refuses_startup() {
        let mut config = Config::default();
        config.use_proxy = true;
        // 3 wallets pour 2 proxies en mode proxy: refus.
        let err = config.validate_inventory(3, 2).unwrap_err();
        assert!(err.to_string().contains("proxies insuffisants"));
        // Sans proxy, le même inventaire passe.
        config.use_proxy = false;
        assert!(config.validate_inventory(3, 2).is_ok());
        // Aucune clé: refus dans tous les modes.
        assert!(config.validate_inventory(0, 0).is_err());
    }
}
