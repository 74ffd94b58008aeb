use thiserror::Error;

/// Les classes d'échec que le coeur distingue. Tout le reste circule en
/// `anyhow::Error` et se fait rattraper à la frontière du pipeline.
#[derive(Debug, Error)]
pub enum BotError {
    /// Fatale: l'inventaire ou la configuration est incohérent, on refuse
    /// de démarrer.
    #[error("configuration invalide: {0}")]
    Config(String),

    /// Le serveur ou la signature a refusé l'authentification de ce wallet.
    /// Le compte est sauté pour le cycle, jamais le batch.
    #[error("authentification impossible: {0}")]
    Auth(String),

    /// 429: le serveur nous limite, cooldown complet avant la tentative
    /// suivante.
    #[error("rate limit atteint, cooldown de {cooldown_secs}s")]
    RateLimited { cooldown_secs: u64 },

    /// 4xx hors 401/429: le contrat client ne correspond plus, aucune
    /// relance n'a de sens.
    #[error("requête rejetée par le serveur ({status}): {message}")]
    ClientRequest { status: u16, message: String },

    /// Réseau, timeout, 5xx: ré-essayé jusqu'au budget puis remonté.
    #[error("erreur de transport: {0}")]
    Transport(String),

    /// Le pipeline d'un compte a dépassé le délai maximal accordé.
    #[error("pipeline abandonné après {0}s")]
    Timeout(u64),
}
