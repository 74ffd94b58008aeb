use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

/// Marge de sécurité: un token qui expire dans moins d'une minute est
/// considéré comme déjà expiré, pour ne pas le voir mourir en plein pipeline.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Deserialize)]
struct Claims {
    exp: Option<i64>,
}

/// Vérifie l'expiration d'un bearer token via son claim `exp`.
/// Aucun contrôle de signature: on décide seulement s'il vaut la peine de
/// le présenter au serveur. Un token illisible est traité comme expiré.
pub fn is_expired(token: &str) -> bool {
    match decode_exp(token) {
        Some(exp) => exp - EXPIRY_MARGIN_SECS <= chrono::Utc::now().timestamp(),
        None => true,
    }
}

fn decode_exp(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    claims.exp
}

/// Fabrique un JWT non signé portant le claim `exp` donné (tests uniquement).
#[cfg(test)]
pub(crate) fn forge_token(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
    format!("{header}.{payload}.signature")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_token_is_valid() {
        let token = forge_token(chrono::Utc::now().timestamp() + 3600);
        assert!(!is_expired(&token));
    }

    #[test]
    fn past_token_is_expired() {
        let token = forge_token(chrono::Utc::now().timestamp() - 3600);
        assert!(is_expired(&token));
    }

    #[test]
    fn near_expiry_counts_as_expired() {
        // Expire dans 10s: sous la marge, donc à renouveler.
        let token = forge_token(chrono::Utc::now().timestamp() + 10);
        assert!(is_expired(&token));
    }

    #[test]
    fn garbage_is_expired() {
        assert!(is_expired("pas-un-jwt"));
        assert!(is_expired(""));
        assert!(is_expired("a.b.c"));
    }
}
