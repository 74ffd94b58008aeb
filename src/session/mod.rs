// src/session/mod.rs

// Identité et état mutable d'un compte: wallet, user agent stable,
// token en cache et ses magasins durables.
pub mod jwt;
pub mod stores;

use crate::error::BotError;
use alloy::signers::Signer;
use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, Result};
use std::sync::Arc;
use stores::{TokenStore, UserAgentStore};
use tracing::info;

/// Pool d'user agents mobiles. Le premier tirage d'une adresse est aléatoire,
/// puis persisté: une adresse garde le même user agent d'un run à l'autre.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_5 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) CriOS/125.0.6422.80 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 16_7_8 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.6 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (iPad; CPU OS 17_5 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (iPad; CPU OS 16_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) CriOS/124.0.6367.111 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.6422.113 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 14; SM-S921B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.6367.114 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 13; SM-A536B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.6422.72 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 13; Redmi Note 12) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.6312.118 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 12; moto g(60)) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.6367.82 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 14; CPH2581) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.6422.53 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 13; V2302A) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.6261.119 Mobile Safari/537.36",
];

/// Classification best-effort de la plateforme d'après l'user agent.
/// `Unknown` est un résultat normal, pas une erreur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Ios,
    Android,
    Unknown,
}

impl Platform {
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_lowercase();
        if ua.contains("iphone") || ua.contains("ipad") {
            Platform::Ios
        } else if ua.contains("android") {
            Platform::Android
        } else {
            Platform::Unknown
        }
    }

    /// Valeur envoyée dans les en-têtes `sec-ch-ua-platform`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::Unknown => "Unknown",
        }
    }
}

/// État d'un compte pour la durée d'un pipeline. Jamais partagé: le
/// scheduler ne lance qu'un pipeline à la fois par compte.
pub struct AccountSession {
    signer: PrivateKeySigner,
    /// Adresse dérivée de la clé, format checksum EIP-55.
    pub address: String,
    /// Position du compte dans le batch, stable pour le run.
    pub index: usize,
    /// Proxy assigné à ce compte (None = connexion directe).
    pub proxy: Option<String>,
    /// User agent stable de la session, résolu par `resolve_identity`.
    pub user_agent: Option<String>,
    pub platform: Platform,
    /// Bearer token en cache, vérifié via son claim `exp`.
    pub token: Option<String>,
    /// IP de sortie résolue via le proxy.
    pub proxy_ip: Option<String>,
    token_store: Arc<TokenStore>,
    ua_store: Arc<UserAgentStore>,
}

impl AccountSession {
    pub fn new(
        private_key: &str,
        index: usize,
        proxy: Option<String>,
        token_store: Arc<TokenStore>,
        ua_store: Arc<UserAgentStore>,
    ) -> Result<Self> {
        let signer: PrivateKeySigner = private_key
            .parse()
            .with_context(|| format!("clé privée invalide pour le compte {}", index + 1))?;
        let address = signer.address().to_string();
        Ok(Self {
            signer,
            address,
            index,
            proxy,
            user_agent: None,
            platform: Platform::Unknown,
            token: None,
            proxy_ip: None,
            token_store,
            ua_store,
        })
    }

    /// Charge ou tire l'user agent stable de cette adresse, le persiste, et
    /// en dérive la plateforme. Deux résolutions de la même adresse donnent
    /// toujours le même résultat.
    pub async fn resolve_identity(&mut self) -> Result<()> {
        let user_agent = match self.ua_store.get(&self.address) {
            Some(ua) => ua,
            None => {
                info!(account = self.index + 1, "[Session] Génération d'un nouvel user agent");
                let ua = USER_AGENTS[fastrand::usize(0..USER_AGENTS.len())].to_string();
                self.ua_store.put(&self.address, &ua).await?;
                ua
            }
        };
        self.platform = Platform::from_user_agent(&user_agent);
        self.user_agent = Some(user_agent);
        Ok(())
    }

    /// Reprend le token du cache durable (relu en début de cycle).
    pub fn load_cached_token(&mut self) {
        self.token = self.token_store.get(&self.address);
    }

    pub fn cached_token_usable(&self) -> bool {
        matches!(&self.token, Some(token) if !jwt::is_expired(token))
    }

    /// Adopte un token fraîchement obtenu et l'écrit dans le cache durable
    /// (uniquement l'entrée de ce compte).
    pub async fn store_token(&mut self, token: String) -> Result<()> {
        self.token_store.put(&self.address, &token).await?;
        self.token = Some(token);
        Ok(())
    }

    /// Signe le message d'onboarding (EIP-191) et construit le payload
    /// d'authentification attendu par le serveur.
    pub async fn sign_onboarding(&self, onboarding_url: &str) -> Result<serde_json::Value, BotError> {
        let message = serde_json::json!({ "onboardingUrl": onboarding_url }).to_string();
        let signature = self.sign(&message).await?;
        Ok(serde_json::json!({
            "signature": signature,
            "walletAddress": self.address,
        }))
    }

    /// Signe la demande de rattachement à un code de parrainage.
    pub async fn sign_referral(&self, code: &str, product: &str) -> Result<serde_json::Value, BotError> {
        let message = serde_json::json!({ "referralCode": code, "product": product }).to_string();
        let signature = self.sign(&message).await?;
        Ok(serde_json::json!({
            "referralCode": code,
            "product": product,
            "signature": signature,
        }))
    }

    async fn sign(&self, message: &str) -> Result<String, BotError> {
        let signature = self
            .signer
            .sign_message(message.as_bytes())
            .await
            .map_err(|e| BotError::Auth(format!("échec de signature: {e}")))?;
        Ok(format!("0x{}", hex::encode(signature.as_bytes())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::stores::JsonStore;

    /// Clé de test bien connue (compte #1 des noeuds de dev).
    const TEST_KEY: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

    fn stores(dir: &tempfile::TempDir) -> (Arc<TokenStore>, Arc<UserAgentStore>) {
        let tokens = Arc::new(JsonStore::open(dir.path().join("tokens.json")).unwrap());
        let agents = Arc::new(JsonStore::open(dir.path().join("session_user_agents.json")).unwrap());
        (tokens, agents)
    }

    #[test]
    fn platform_detection_has_unknown_variant() {
        assert_eq!(Platform::from_user_agent("Mozilla/5.0 (iPhone; ...)"), Platform::Ios);
        assert_eq!(Platform::from_user_agent("Mozilla/5.0 (iPad; ...)"), Platform::Ios);
        assert_eq!(Platform::from_user_agent("Mozilla/5.0 (Linux; Android 14; Pixel 8)"), Platform::Android);
        assert_eq!(Platform::from_user_agent("Mozilla/5.0 (X11; Linux x86_64)"), Platform::Unknown);
        assert_eq!(Platform::Unknown.as_str(), "Unknown");
    }

    #[test]
    fn address_is_derived_from_key() {
        let dir = tempfile::tempdir().unwrap();
        let (tokens, agents) = stores(&dir);
        let session = AccountSession::new(TEST_KEY, 0, None, tokens, agents).unwrap();
        assert!(session.address.starts_with("0x"));
        assert_eq!(session.address.len(), 42);
    }

    #[tokio::test]
    async fn identity_resolution_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (tokens, agents) = stores(&dir);

        let mut first = AccountSession::new(TEST_KEY, 0, None, tokens.clone(), agents.clone()).unwrap();
        first.resolve_identity().await.unwrap();
        let ua_first = first.user_agent.clone().unwrap();

        // Une nouvelle session sur la même adresse retombe sur le même
        // user agent, y compris après relecture du fichier.
        let agents_reopened =
            Arc::new(JsonStore::open(dir.path().join("session_user_agents.json")).unwrap());
        let mut second = AccountSession::new(TEST_KEY, 0, None, tokens, agents_reopened).unwrap();
        second.resolve_identity().await.unwrap();
        assert_eq!(second.user_agent.unwrap(), ua_first);
        assert_ne!(second.platform, Platform::Unknown);
    }

    #[tokio::test]
    async fn expired_cached_token_is_not_usable() {
        let dir = tempfile::tempdir().unwrap();
        let (tokens, agents) = stores(&dir);
        let mut session = AccountSession::new(TEST_KEY, 0, None, tokens, agents).unwrap();

        session.token = Some(jwt::forge_token(chrono::Utc::now().timestamp() - 10));
        assert!(!session.cached_token_usable());

        session
            .store_token(jwt::forge_token(chrono::Utc::now().timestamp() + 3600))
            .await
            .unwrap();
        assert!(session.cached_token_usable());
        // Et l'entrée a bien été persistée sous l'adresse du compte.
        let address = session.address.clone();
        assert!(session.token_store.get(&address).is_some());
    }
}
