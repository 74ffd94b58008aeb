use super::retry::{RetryAction, classify_status};
use super::types::{ApiResponse, AuthResponse};
use crate::config::Config;
use crate::error::BotError;
use crate::monitoring::metrics;
use crate::session::AccountSession;
use anyhow::{Context, Result, bail};
use reqwest::Method;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Délai maximal d'une requête individuelle.
const HTTP_TIMEOUT_SECS: u64 = 30;
/// URL référencée par le message d'onboarding signé.
const ONBOARDING_URL: &str = "https://quest.somnia.network";
const REFERRAL_PRODUCT: &str = "QUEST_PLATFORM";
/// Service externe utilisé pour résoudre l'IP de sortie du proxy.
const IP_CHECK_URL: &str = "https://api.ipify.org?format=json";

#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Tentatives supplémentaires après le premier échec.
    pub retries: u32,
    /// Vrai pour l'appel d'authentification lui-même: pas d'en-tête Bearer
    /// et jamais de rafraîchissement de token sur 401.
    pub auth_call: bool,
}

/// Client HTTP d'un compte: une session, un point de sortie réseau (proxy
/// éventuel) et la boucle de retry commune à tous les endpoints.
pub struct QuestClient {
    pub session: AccountSession,
    http: reqwest::Client,
    config: Arc<Config>,
}

impl QuestClient {
    pub fn new(session: AccountSession, config: Arc<Config>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(10));
        if config.use_proxy {
            if let Some(proxy_url) = &session.proxy {
                let proxy = reqwest::Proxy::all(proxy_url)
                    .with_context(|| format!("proxy invalide: {proxy_url}"))?;
                builder = builder.proxy(proxy);
            }
        }
        let http = builder.build().context("construction du client HTTP")?;
        Ok(Self {
            session,
            http,
            config,
        })
    }

    fn opts(&self) -> RequestOptions {
        RequestOptions {
            retries: self.config.request_retries,
            auth_call: false,
        }
    }

    /// En-têtes de session: user agent stable et plateforme dérivée.
    fn session_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(ua) = &self.session.user_agent {
            if let Ok(value) = HeaderValue::from_str(ua) {
                headers.insert(USER_AGENT, value);
            }
        }
        let platform = self.session.platform.as_str();
        let brand = format!(
            "\"Not)A;Brand\";v=\"99\", \"{platform} WebView\";v=\"127\", \"Chromium\";v=\"127\""
        );
        if let Ok(value) = HeaderValue::from_str(&brand) {
            headers.insert("sec-ch-ua", value);
        }
        if let Ok(value) = HeaderValue::from_str(platform) {
            headers.insert("sec-ch-ua-platform", value);
        }
        headers
    }

    /// Exécute une requête avec la table de policy, SANS gestion du 401:
    /// un 401 remonte immédiatement à `request`, qui décide du
    /// rafraîchissement. L'échec final porte toujours la dernière erreur
    /// observée.
    async fn execute(
        &self,
        url: &str,
        method: &Method,
        body: Option<&serde_json::Value>,
        opts: &RequestOptions,
        token: Option<&str>,
    ) -> ApiResponse {
        let mut last_failure = ApiResponse::failed(None, "aucune tentative effectuée".to_string());
        for attempt in 0..=opts.retries {
            let mut request = self
                .http
                .request(method.clone(), url)
                .headers(self.session_headers());
            if !opts.auth_call {
                request = request.header(
                    AUTHORIZATION,
                    format!("Bearer {}", token.unwrap_or_default()),
                );
            }
            if let Some(body) = body {
                if *method != Method::GET {
                    request = request.json(body);
                }
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        let value: serde_json::Value = match response.json().await {
                            Ok(value) => value,
                            Err(e) => {
                                // Flux interrompu en plein corps de réponse:
                                // échec immédiat, sans relance.
                                return ApiResponse::failed(
                                    Some(status),
                                    format!("flux interrompu: {e}"),
                                );
                            }
                        };
                        // L'API enveloppe sa charge utile dans un champ
                        // `data` sur la plupart des endpoints.
                        let data = if value.get("data").is_some_and(|d| !d.is_null()) {
                            value["data"].clone()
                        } else {
                            value
                        };
                        return ApiResponse::ok(status, data);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let message = extract_error_message(&body_text, status);
                    warn!(
                        account = self.session.index + 1,
                        url, status, "[Api] Requête en échec: {message}"
                    );
                    last_failure = ApiResponse::failed(Some(status), message.clone());
                    match classify_status(Some(status)) {
                        RetryAction::RefreshToken => return last_failure,
                        RetryAction::Fail => {
                            return ApiResponse::failed(
                                Some(status),
                                BotError::ClientRequest { status, message }.to_string(),
                            );
                        }
                        RetryAction::Cooldown => {
                            metrics::RATE_LIMIT_HITS.inc();
                            let cooldown_secs = self.config.rate_limit_cooldown_secs;
                            last_failure = ApiResponse::failed(
                                Some(status),
                                BotError::RateLimited { cooldown_secs }.to_string(),
                            );
                            if attempt < opts.retries {
                                warn!(
                                    account = self.session.index + 1,
                                    "[Api] Rate limit, cooldown de {cooldown_secs}s"
                                );
                                sleep(Duration::from_secs(cooldown_secs)).await;
                            }
                        }
                        RetryAction::RetryAfterDelay => {
                            if attempt < opts.retries {
                                metrics::REQUEST_RETRIES.inc();
                                sleep(Duration::from_secs(
                                    self.config.delay_between_requests_secs,
                                ))
                                .await;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        account = self.session.index + 1,
                        url, "[Api] Erreur de transport: {e}"
                    );
                    last_failure = ApiResponse::failed(
                        e.status().map(|s| s.as_u16()),
                        BotError::Transport(e.to_string()).to_string(),
                    );
                    // Corps abandonné par le serveur: inutile de rejouer.
                    if e.is_body() || e.is_decode() {
                        return last_failure;
                    }
                    if attempt < opts.retries {
                        metrics::REQUEST_RETRIES.inc();
                        sleep(Duration::from_secs(self.config.delay_between_requests_secs)).await;
                    }
                }
            }
        }
        last_failure
    }

    /// Point d'entrée de tous les endpoints authentifiés. Sur 401, force UN
    /// rafraîchissement de token puis rejoue la requête une seule fois; si
    /// aucun token n'est obtenable, l'échec est définitif pour cet appel.
    pub async fn request(
        &mut self,
        url: &str,
        method: Method,
        body: Option<serde_json::Value>,
        opts: RequestOptions,
    ) -> ApiResponse {
        let token = if opts.auth_call {
            None
        } else {
            self.session.token.clone()
        };
        let first = self
            .execute(url, &method, body.as_ref(), &opts, token.as_deref())
            .await;
        if first.status != Some(401) || opts.auth_call {
            return first;
        }

        info!(
            account = self.session.index + 1,
            "[Api] Session expirée (401), rafraîchissement forcé du token"
        );
        match self.valid_token(true).await {
            Ok(Some(token)) => {
                self.execute(url, &method, body.as_ref(), &opts, Some(&token))
                    .await
            }
            Ok(None) => ApiResponse::failed(
                Some(401),
                "session expirée et token non renouvelable".to_string(),
            ),
            Err(e) => ApiResponse::failed(
                Some(401),
                format!("rafraîchissement du token impossible: {e:#}"),
            ),
        }
    }

    /// Retourne un token utilisable: celui en cache s'il n'est pas expiré
    /// (sauf `force`), sinon ré-authentifie via le message d'onboarding
    /// signé. `Ok(None)` signifie que le serveur a refusé ce wallet: le
    /// compte est à sauter pour le cycle.
    pub async fn valid_token(&mut self, force: bool) -> Result<Option<String>> {
        if !force && self.session.cached_token_usable() {
            return Ok(self.session.token.clone());
        }

        info!(
            account = self.session.index + 1,
            "[Api] Token absent ou expiré, nouvelle authentification"
        );
        let payload = self.session.sign_onboarding(ONBOARDING_URL).await?;
        let url = format!("{}/auth/onboard", self.config.base_url);
        let opts = RequestOptions {
            retries: self.config.request_retries,
            auth_call: true,
        };
        let response = self
            .execute(&url, &Method::POST, Some(&payload), &opts, None)
            .await;
        if !response.success {
            warn!(
                account = self.session.index + 1,
                "[Api] Authentification refusée: {}",
                response.error.as_deref().unwrap_or("raison inconnue")
            );
            return Ok(None);
        }
        let auth: AuthResponse = match response.json() {
            Ok(auth) => auth,
            Err(e) => {
                warn!(
                    account = self.session.index + 1,
                    "[Api] Réponse d'authentification illisible: {e:#}"
                );
                return Ok(None);
            }
        };
        match auth.token {
            Some(new_token) => {
                info!(account = self.session.index + 1, "[Api] Nouveau token obtenu");
                metrics::TOKENS_REFRESHED.inc();
                self.session.store_token(new_token.clone()).await?;
                Ok(Some(new_token))
            }
            None => {
                warn!(
                    account = self.session.index + 1,
                    "[Api] Réponse d'authentification sans token"
                );
                Ok(None)
            }
        }
    }

    /// Résout l'IP de sortie via le proxy de la session. Une erreur ici
    /// disqualifie le compte pour le cycle, jamais le batch.
    pub async fn check_proxy_ip(&mut self) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct IpResponse {
            ip: String,
        }
        let response = self
            .http
            .get(IP_CHECK_URL)
            .send()
            .await
            .context("vérification de l'IP de sortie")?;
        if !response.status().is_success() {
            bail!("vérification d'IP en statut {}", response.status());
        }
        let body: IpResponse = response.json().await.context("réponse ipify illisible")?;
        self.session.proxy_ip = Some(body.ip.clone());
        Ok(body.ip)
    }

    // --- Endpoints de la plateforme ---

    pub async fn get_profile(&mut self) -> ApiResponse {
        let url = format!("{}/users/me", self.config.base_url);
        self.request(&url, Method::GET, None, self.opts()).await
    }

    pub async fn get_stats(&mut self) -> ApiResponse {
        let url = format!("{}/stats", self.config.base_url);
        self.request(&url, Method::GET, None, self.opts()).await
    }

    pub async fn get_campaigns(&mut self) -> ApiResponse {
        let url = format!("{}/campaigns", self.config.base_url);
        self.request(&url, Method::GET, None, self.opts()).await
    }

    pub async fn get_campaign_detail(&mut self, id: u64) -> ApiResponse {
        let url = format!("{}/campaigns/{id}", self.config.base_url);
        self.request(&url, Method::GET, None, self.opts()).await
    }

    /// Historique on-chain du compte, via l'API v2 de l'explorateur.
    pub async fn get_transactions(&mut self) -> ApiResponse {
        let url = format!(
            "{}/addresses/{}/transactions",
            self.config.base_url_v2, self.session.address
        );
        self.request(&url, Method::GET, None, self.opts()).await
    }

    pub async fn claim_social(&mut self, payload: &serde_json::Value, claim_type: &str) -> ApiResponse {
        let url = format!("{}/social/{claim_type}", self.config.base_url);
        self.request(&url, Method::POST, Some(payload.clone()), self.opts())
            .await
    }

    pub async fn claim_onchain(&mut self, payload: &serde_json::Value, claim_type: &str) -> ApiResponse {
        let url = format!("{}/onchain/{claim_type}", self.config.base_url);
        self.request(&url, Method::POST, Some(payload.clone()), self.opts())
            .await
    }

    /// Rattache le compte au code de parrainage configuré (best-effort).
    pub async fn add_referral(&mut self) -> ApiResponse {
        let payload = match self
            .session
            .sign_referral(&self.config.ref_code, REFERRAL_PRODUCT)
            .await
        {
            Ok(payload) => payload,
            Err(e) => {
                return ApiResponse::failed(None, format!("signature du parrainage impossible: {e}"));
            }
        };
        let url = format!("{}/users/referrals", self.config.base_url);
        self.request(&url, Method::POST, Some(payload), self.opts())
            .await
    }

    pub async fn get_referral_stats(&mut self) -> ApiResponse {
        let url = format!("{}/referral/stats", self.config.base_url);
        self.request(&url, Method::GET, None, self.opts()).await
    }
}

/// Extrait un message lisible du corps d'erreur (`{error}` ou `{message}`),
/// sinon retombe sur le statut brut.
fn extract_error_message(body: &str, status: u16) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("error")
                .or_else(|| value.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            if body.is_empty() {
                format!("HTTP {status}")
            } else {
                body.chars().take(200).collect()
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::jwt;
    use crate::session::stores::JsonStore;
    use std::time::Instant;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_KEY: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

    async fn test_client(server: &MockServer, dir: &tempfile::TempDir) -> QuestClient {
        let mut config = Config::default();
        config.base_url = server.uri();
        config.base_url_v2 = server.uri();
        config.delay_between_requests_secs = 0;
        config.rate_limit_cooldown_secs = 1;
        config.request_retries = 2;
        let tokens = std::sync::Arc::new(JsonStore::open(dir.path().join("tokens.json")).unwrap());
        let agents =
            std::sync::Arc::new(JsonStore::open(dir.path().join("agents.json")).unwrap());
        let session = AccountSession::new(TEST_KEY, 0, None, tokens, agents).unwrap();
        QuestClient::new(session, std::sync::Arc::new(config)).unwrap()
    }

    fn fresh_jwt() -> String {
        jwt::forge_token(chrono::Utc::now().timestamp() + 3600)
    }

    #[tokio::test]
    async fn unauthorized_triggers_exactly_one_refresh_then_replay() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("GET"))
            .and(path("/users/me"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "username": "alice", "referralCode": "REF1" }
            })))
            .mount(&server)
            .await;
        let token = fresh_jwt();
        Mock::given(method("POST"))
            .and(path("/auth/onboard"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "token": token }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut client = test_client(&server, &dir).await;
        let response = client.get_profile().await;
        assert!(response.success);
        // Le nouveau token est en session ET dans le cache durable.
        assert_eq!(client.session.token.as_deref(), Some(token.as_str()));
        let address = client.session.address.clone();
        let store = JsonStore::open(dir.path().join("tokens.json")).unwrap();
        assert_eq!(store.get(&address).as_deref(), Some(token.as_str()));
    }

    #[tokio::test]
    async fn unauthorized_with_unrefreshable_token_fails_without_looping() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("GET"))
            .and(path("/users/me"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/onboard"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut client = test_client(&server, &dir).await;
        let response = client.get_profile().await;
        assert!(!response.success);

        // Un seul 401 encaissé, et l'authentification n'a consommé que son
        // propre budget de retries (pas de boucle infinie).
        let requests = server.received_requests().await.unwrap();
        let me_calls = requests.iter().filter(|r| r.url.path() == "/users/me").count();
        let onboard_calls = requests
            .iter()
            .filter(|r| r.url.path() == "/auth/onboard")
            .count();
        assert_eq!(me_calls, 1);
        assert_eq!(onboard_calls, 3); // 1 tentative + 2 retries
    }

    #[tokio::test]
    async fn bad_request_is_terminal() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("GET"))
            .and(path("/stats"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(serde_json::json!({ "error": "contrat invalide" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut client = test_client(&server, &dir).await;
        client.session.token = Some(fresh_jwt());
        let response = client.get_stats().await;
        assert!(!response.success);
        assert_eq!(response.status, Some(400));
        assert!(response.error.as_deref().unwrap().contains("contrat invalide"));
    }

    #[tokio::test]
    async fn rate_limit_waits_full_cooldown_before_next_attempt() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("GET"))
            .and(path("/stats"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/stats"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "totalPoints": 12.0 }
            })))
            .mount(&server)
            .await;

        let mut client = test_client(&server, &dir).await;
        client.session.token = Some(fresh_jwt());
        let started = Instant::now();
        let response = client.get_stats().await;
        assert!(response.success);
        // Cooldown configuré à 1s dans le client de test.
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn exhausted_retries_carry_the_last_failure() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("GET"))
            .and(path("/campaigns"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3) // 1 tentative + 2 retries
            .mount(&server)
            .await;

        let mut client = test_client(&server, &dir).await;
        client.session.token = Some(fresh_jwt());
        let response = client.get_campaigns().await;
        assert!(!response.success);
        assert_eq!(response.status, Some(503));
        assert!(response.error.as_deref().unwrap_or_default().contains("503"));
    }

    #[tokio::test]
    async fn expired_cached_token_forces_reauthentication() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        let token = fresh_jwt();
        Mock::given(method("POST"))
            .and(path("/auth/onboard"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "token": token }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut client = test_client(&server, &dir).await;
        client.session.token = Some(jwt::forge_token(chrono::Utc::now().timestamp() - 10));

        let obtained = client.valid_token(false).await.unwrap();
        assert_eq!(obtained.as_deref(), Some(token.as_str()));
        assert!(client.session.cached_token_usable());
    }

    #[tokio::test]
    async fn valid_cached_token_short_circuits_authentication() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        // Aucun mock monté: tout appel réseau ferait échouer le test via
        // l'assertion ci-dessous.

        let mut client = test_client(&server, &dir).await;
        let token = fresh_jwt();
        client.session.token = Some(token.clone());

        let obtained = client.valid_token(false).await.unwrap();
        assert_eq!(obtained.as_deref(), Some(token.as_str()));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_credential_yields_none() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("POST"))
            .and(path("/auth/onboard"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_json(serde_json::json!({ "message": "wallet banni" })),
            )
            .mount(&server)
            .await;

        let mut client = test_client(&server, &dir).await;
        let obtained = client.valid_token(true).await.unwrap();
        assert!(obtained.is_none());
        // 403 est terminal: une seule requête, pas de relance.
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }
}
