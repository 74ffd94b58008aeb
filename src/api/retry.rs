/// Action à entreprendre après une réponse en échec. La policy est une table
/// statut -> action, isolée du transport pour rester testable seule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// 401: rafraîchir le token (une seule fois par appel) puis rejouer la
    /// même requête.
    RefreshToken,
    /// 429: attendre le cooldown complet avant la tentative suivante.
    Cooldown,
    /// 4xx hors 401/429: le contrat client ne correspond plus, échec
    /// terminal immédiat.
    Fail,
    /// Tout le reste (5xx, timeout, réseau): petite pause puis relance,
    /// jusqu'à épuisement du budget.
    RetryAfterDelay,
}

pub fn classify_status(status: Option<u16>) -> RetryAction {
    match status {
        Some(401) => RetryAction::RefreshToken,
        Some(429) => RetryAction::Cooldown,
        Some(status) if (400..500).contains(&status) => RetryAction::Fail,
        _ => RetryAction::RetryAfterDelay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_table_is_exhaustive() {
        assert_eq!(classify_status(Some(401)), RetryAction::RefreshToken);
        assert_eq!(classify_status(Some(429)), RetryAction::Cooldown);
        assert_eq!(classify_status(Some(400)), RetryAction::Fail);
        assert_eq!(classify_status(Some(403)), RetryAction::Fail);
        assert_eq!(classify_status(Some(404)), RetryAction::Fail);
        // 5xx et absence de statut (panne transport): retry.
        assert_eq!(classify_status(Some(500)), RetryAction::RetryAfterDelay);
        assert_eq!(classify_status(Some(503)), RetryAction::RetryAfterDelay);
        assert_eq!(classify_status(None), RetryAction::RetryAfterDelay);
    }
}
