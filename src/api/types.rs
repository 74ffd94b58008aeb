// src/api/types.rs

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// Résultat d'une requête après application de la policy de retry.
/// Rien ne traverse cette frontière en panique: les appelants testent
/// `success` et lisent `error` en cas d'échec.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub success: bool,
    pub status: Option<u16>,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ApiResponse {
    pub fn ok(status: u16, data: serde_json::Value) -> Self {
        Self {
            success: true,
            status: Some(status),
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(status: Option<u16>, error: String) -> Self {
        Self {
            success: false,
            status,
            data: None,
            error: Some(error),
        }
    }

    /// Désérialise la charge utile vers un modèle typé.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| anyhow!("réponse sans charge utile"))?;
        serde_json::from_value(data).context("désérialisation de la réponse")
    }
}

/// Réponse de `POST /auth/onboard`.
#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    pub token: Option<String>,
}

/// Profil du compte (`GET /users/me`).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub discord_name: Option<String>,
    #[serde(default)]
    pub twitter_name: Option<String>,
    #[serde(default)]
    pub referral_code: Option<String>,
}

/// Compteurs de points et de streak (`GET /stats`).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStats {
    #[serde(default)]
    pub final_points: Option<f64>,
    #[serde(default)]
    pub total_points: Option<f64>,
    #[serde(default)]
    pub rank: Option<u64>,
    #[serde(default)]
    pub streak_count: Option<u64>,
    #[serde(default)]
    pub season_id: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignDetail {
    #[serde(default)]
    pub quests: Vec<Quest>,
}

/// Unité réclamable d'une campagne. Relu à chaque cycle, jamais mis en cache.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Quest {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default)]
    pub quest_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub is_participated: bool,
    #[serde(default)]
    pub campaign_id: u64,
}

/// Page d'historique de l'explorateur v2. Les champs sont en snake_case
/// côté serveur, pas de rename global ici.
#[derive(Debug, Deserialize)]
pub struct TransactionPage {
    #[serde(default)]
    pub items: Vec<ChainTransaction>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainTransaction {
    pub hash: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub transaction_types: Vec<String>,
    #[serde(default)]
    pub from: Option<AddressRef>,
    #[serde(default)]
    pub to: Option<AddressRef>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AddressRef {
    #[serde(default)]
    pub hash: String,
}

impl ChainTransaction {
    pub fn is_success(&self) -> bool {
        self.result == "success"
    }

    /// Transfert natif (et non appel de contrat ou mint de token).
    pub fn is_coin_transfer(&self) -> bool {
        self.transaction_types
            .first()
            .is_some_and(|kind| kind == "coin_transfer")
    }

    /// Les adresses de l'explorateur sont en checksum EIP-55: comparaison
    /// insensible à la casse.
    pub fn is_incoming_for(&self, address: &str) -> bool {
        self.to
            .as_ref()
            .is_some_and(|to| to.hash.eq_ignore_ascii_case(address))
    }

    pub fn is_outgoing_for(&self, address: &str) -> bool {
        self.from
            .as_ref()
            .is_some_and(|from| from.hash.eq_ignore_ascii_case(address))
    }
}
