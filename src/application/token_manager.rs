use crate::domain::models::OAuthToken;
use crate::infrastructure::config::OAuthConfig;
use crate::infrastructure::credential_store::CredentialStore;
use crate::infrastructure::error::EngineError;
use crate::infrastructure::oauth_client::{
    OAuthCodeExchangeRequest, OAuthHttpClient, OAuthRefreshRequest, OAuthTokenResponse,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_REFRESH_MARGIN_SECONDS: i64 = 300;

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Access token handed to a sync pass, stamped with the credential generation
/// it was issued under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub generation: u64,
}

#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn get_valid_token(&self, user_id: &str) -> Result<AccessGrant, EngineError>;

    /// False once the credential the grant came from has been revoked.
    fn is_grant_current(&self, user_id: &str, grant: &AccessGrant) -> Result<bool, EngineError>;
}

pub struct TokenManager<S, C>
where
    S: CredentialStore,
    C: OAuthHttpClient,
{
    config: OAuthConfig,
    credential_store: Arc<S>,
    oauth_client: Arc<C>,
    now_provider: NowProvider,
    refresh_margin_seconds: i64,
    generations: Mutex<HashMap<String, u64>>,
}

impl<S, C> TokenManager<S, C>
where
    S: CredentialStore,
    C: OAuthHttpClient,
{
    pub fn new(config: OAuthConfig, credential_store: Arc<S>, oauth_client: Arc<C>) -> Self {
        Self {
            config,
            credential_store,
            oauth_client,
            now_provider: Arc::new(Utc::now),
            refresh_margin_seconds: DEFAULT_REFRESH_MARGIN_SECONDS,
            generations: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn with_refresh_margin_seconds(mut self, refresh_margin_seconds: i64) -> Self {
        self.refresh_margin_seconds = refresh_margin_seconds.max(0);
        self
    }

    pub fn authorization_url(&self, state: &str) -> Result<String, EngineError> {
        if state.trim().is_empty() {
            return Err(EngineError::Validation("state must not be empty".to_string()));
        }
        if self.config.scopes.is_empty() {
            return Err(EngineError::InvalidConfig(
                "at least one scope is required".to_string(),
            ));
        }

        let mut url = Url::parse(&self.config.authorization_endpoint).map_err(|error| {
            EngineError::InvalidConfig(format!("invalid authorization endpoint: {error}"))
        })?;
        let scope = self.config.scopes.join(" ");

        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &scope)
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("state", state);

        Ok(url.to_string())
    }

    pub async fn connect_with_code(
        &self,
        user_id: &str,
        authorization_code: &str,
    ) -> Result<AccessGrant, EngineError> {
        validate_user_id(user_id)?;
        if authorization_code.trim().is_empty() {
            return Err(EngineError::Validation(
                "authorization code must not be empty".to_string(),
            ));
        }

        let response = self
            .oauth_client
            .exchange_authorization_code(OAuthCodeExchangeRequest {
                token_endpoint: self.config.token_endpoint.clone(),
                client_id: self.config.client_id.clone(),
                client_secret: self.config.client_secret.clone(),
                redirect_uri: self.config.redirect_uri.clone(),
                authorization_code: authorization_code.trim().to_string(),
            })
            .await?;

        let token = self.token_from_response(response, None);
        self.credential_store.save_token(user_id, &token)?;
        info!(user_id, "calendar account connected");
        Ok(AccessGrant {
            access_token: token.access_token,
            expires_at: token.expires_at,
            generation: self.generation(user_id)?,
        })
    }

    /// Deletes the stored credential and invalidates grants already handed out.
    pub fn revoke(&self, user_id: &str) -> Result<bool, EngineError> {
        validate_user_id(user_id)?;
        self.bump_generation(user_id)?;
        let existed = self.credential_store.delete_token(user_id)?;
        info!(user_id, existed, "calendar credential revoked");
        Ok(existed)
    }

    pub fn generation(&self, user_id: &str) -> Result<u64, EngineError> {
        Ok(self.lock_generations()?.get(user_id).copied().unwrap_or(0))
    }

    fn lock_generations(&self) -> Result<MutexGuard<'_, HashMap<String, u64>>, EngineError> {
        self.generations.lock().map_err(|error| {
            EngineError::Credential(format!("generation lock poisoned: {error}"))
        })
    }

    fn bump_generation(&self, user_id: &str) -> Result<u64, EngineError> {
        let mut generations = self.lock_generations()?;
        let generation = generations.entry(user_id.to_string()).or_insert(0);
        *generation += 1;
        Ok(*generation)
    }

    fn grant_for(&self, token: &OAuthToken, generation: u64) -> AccessGrant {
        AccessGrant {
            access_token: token.access_token.clone(),
            expires_at: token.expires_at,
            generation,
        }
    }

    fn token_from_response(
        &self,
        response: OAuthTokenResponse,
        fallback_refresh_token: Option<String>,
    ) -> OAuthToken {
        let expires_at = (self.now_provider)() + Duration::seconds(response.expires_in.max(0));
        OAuthToken {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(fallback_refresh_token),
            expires_at,
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scope: response.scope,
        }
    }
}

#[async_trait]
impl<S, C> AccessTokenProvider for TokenManager<S, C>
where
    S: CredentialStore,
    C: OAuthHttpClient,
{
    async fn get_valid_token(&self, user_id: &str) -> Result<AccessGrant, EngineError> {
        validate_user_id(user_id)?;
        let generation = self.generation(user_id)?;
        let Some(stored_token) = self.credential_store.load_token(user_id)? else {
            return Err(EngineError::Auth(format!(
                "no calendar credential stored for user {user_id}"
            )));
        };

        let now = (self.now_provider)();
        if stored_token.is_valid_at(now, self.refresh_margin_seconds) {
            return Ok(self.grant_for(&stored_token, generation));
        }

        let Some(refresh_token) = stored_token.refresh_token.clone() else {
            return Err(EngineError::Auth(
                "access token expired and no refresh token is stored; reconnect the account"
                    .to_string(),
            ));
        };

        debug!(user_id, expires_at = %stored_token.expires_at, "refreshing access token");
        let response = self
            .oauth_client
            .refresh_access_token(OAuthRefreshRequest {
                token_endpoint: self.config.token_endpoint.clone(),
                client_id: self.config.client_id.clone(),
                client_secret: self.config.client_secret.clone(),
                refresh_token,
            })
            .await
            .map_err(|error| match error {
                EngineError::Auth(message) => {
                    warn!(user_id, %message, "refresh token rejected");
                    EngineError::Auth(format!("reauthentication required: {message}"))
                }
                other => other,
            })?;

        let token = self.token_from_response(response, stored_token.refresh_token.clone());
        {
            // Check and save under one lock: a revoke either lands before the check and
            // discards the new token, or waits for the save and deletes it.
            let generations = self.lock_generations()?;
            if generations.get(user_id).copied().unwrap_or(0) != generation {
                return Err(EngineError::Auth(format!(
                    "calendar credential for user {user_id} was revoked"
                )));
            }
            self.credential_store.save_token(user_id, &token)?;
        }
        info!(user_id, expires_at = %token.expires_at, "access token refreshed");
        Ok(self.grant_for(&token, generation))
    }

    fn is_grant_current(&self, user_id: &str, grant: &AccessGrant) -> Result<bool, EngineError> {
        Ok(self.generation(user_id)? == grant.generation)
    }
}

fn validate_user_id(user_id: &str) -> Result<(), EngineError> {
    if user_id.trim().is_empty() {
        return Err(EngineError::Validation("user id must not be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::infrastructure::credential_store::InMemoryCredentialStore;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::{OnceLock, Weak};
    use std::thread;

    #[derive(Debug, Clone)]
    pub(crate) enum FakeResponse {
        Success(OAuthTokenResponse),
        Rejected(String),
        Unavailable,
    }

    impl Default for FakeResponse {
        fn default() -> Self {
            Self::Success(OAuthTokenResponse {
                access_token: "fake_access".to_string(),
                refresh_token: Some("fake_refresh".to_string()),
                expires_in: 3600,
                token_type: Some("Bearer".to_string()),
                scope: Some("scope-a scope-b".to_string()),
            })
        }
    }

    impl FakeResponse {
        fn into_result(self) -> Result<OAuthTokenResponse, EngineError> {
            match self {
                Self::Success(value) => Ok(value),
                Self::Rejected(message) => Err(EngineError::Auth(message)),
                Self::Unavailable => Err(EngineError::Network("token endpoint down".to_string())),
            }
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct FakeOAuthHttpClient {
        exchange_response: Mutex<FakeResponse>,
        refresh_response: Mutex<FakeResponse>,
        pub(crate) exchange_calls: AtomicUsize,
        pub(crate) refresh_calls: AtomicUsize,
    }

    impl FakeOAuthHttpClient {
        fn set_exchange_response(&self, response: FakeResponse) {
            *self.exchange_response.lock().expect("exchange mutex poisoned") = response;
        }

        fn set_refresh_response(&self, response: FakeResponse) {
            *self.refresh_response.lock().expect("refresh mutex poisoned") = response;
        }
    }

    #[async_trait]
    impl OAuthHttpClient for FakeOAuthHttpClient {
        async fn exchange_authorization_code(
            &self,
            _request: OAuthCodeExchangeRequest,
        ) -> Result<OAuthTokenResponse, EngineError> {
            self.exchange_calls.fetch_add(1, Ordering::SeqCst);
            self.exchange_response
                .lock()
                .expect("exchange mutex poisoned")
                .clone()
                .into_result()
        }

        async fn refresh_access_token(
            &self,
            _request: OAuthRefreshRequest,
        ) -> Result<OAuthTokenResponse, EngineError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.refresh_response
                .lock()
                .expect("refresh mutex poisoned")
                .clone()
                .into_result()
        }
    }

    pub(crate) fn test_config() -> OAuthConfig {
        OAuthConfig::new(
            "client-id",
            "client-secret",
            "http://localhost/oauth2/callback",
            vec![
                "https://www.googleapis.com/auth/calendar".to_string(),
                "openid".to_string(),
            ],
        )
    }

    pub(crate) fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    pub(crate) fn token_expiring_at(expires_at: DateTime<Utc>) -> OAuthToken {
        OAuthToken {
            access_token: "stored-access".to_string(),
            refresh_token: Some("stored-refresh".to_string()),
            expires_at,
            token_type: "Bearer".to_string(),
            scope: None,
        }
    }

    fn manager_at(
        now: DateTime<Utc>,
        store: &Arc<InMemoryCredentialStore>,
        client: &Arc<FakeOAuthHttpClient>,
    ) -> TokenManager<InMemoryCredentialStore, FakeOAuthHttpClient> {
        TokenManager::new(test_config(), Arc::clone(store), Arc::clone(client))
            .with_now_provider(Arc::new(move || now))
    }

    proptest! {
        #[test]
        fn token_outside_margin_is_used_without_refresh(seconds_left in 301i64..604800i64) {
            let runtime = tokio::runtime::Runtime::new().expect("runtime");
            runtime.block_on(async move {
                let now = fixed_time("2025-01-06T09:00:00Z");
                let store = Arc::new(InMemoryCredentialStore::default());
                store
                    .save_token("user-1", &token_expiring_at(now + Duration::seconds(seconds_left)))
                    .expect("save token");
                let client = Arc::new(FakeOAuthHttpClient::default());

                let grant = manager_at(now, &store, &client)
                    .get_valid_token("user-1")
                    .await
                    .expect("grant");

                assert_eq!(grant.access_token, "stored-access");
                assert_eq!(client.refresh_calls.load(Ordering::SeqCst), 0);
            });
        }

        #[test]
        fn token_inside_margin_is_refreshed(seconds_left in -86400i64..=300i64) {
            let runtime = tokio::runtime::Runtime::new().expect("runtime");
            runtime.block_on(async move {
                let now = fixed_time("2025-01-06T09:00:00Z");
                let store = Arc::new(InMemoryCredentialStore::default());
                store
                    .save_token("user-1", &token_expiring_at(now + Duration::seconds(seconds_left)))
                    .expect("save token");
                let client = Arc::new(FakeOAuthHttpClient::default());

                let grant = manager_at(now, &store, &client)
                    .get_valid_token("user-1")
                    .await
                    .expect("grant");

                assert_eq!(grant.access_token, "fake_access");
                assert_eq!(client.refresh_calls.load(Ordering::SeqCst), 1);
            });
        }
    }

    #[tokio::test]
    async fn refreshed_token_keeps_previous_refresh_token() {
        let now = fixed_time("2025-01-06T09:00:00Z");
        let store = Arc::new(InMemoryCredentialStore::default());
        store
            .save_token("user-1", &token_expiring_at(now - Duration::seconds(120)))
            .expect("save token");
        let client = Arc::new(FakeOAuthHttpClient::default());
        client.set_refresh_response(FakeResponse::Success(OAuthTokenResponse {
            access_token: "new-access-token".to_string(),
            refresh_token: None,
            expires_in: 3600,
            token_type: None,
            scope: None,
        }));

        let grant = manager_at(now, &store, &client)
            .get_valid_token("user-1")
            .await
            .expect("grant");
        assert_eq!(grant.expires_at, now + Duration::seconds(3600));

        let stored = store
            .load_token("user-1")
            .expect("load token")
            .expect("token stored");
        assert_eq!(stored.access_token, "new-access-token");
        assert_eq!(stored.refresh_token.as_deref(), Some("stored-refresh"));
        assert_eq!(stored.token_type, "Bearer");
    }

    #[tokio::test]
    async fn rejected_refresh_requires_reauthentication() {
        let now = fixed_time("2025-01-06T09:00:00Z");
        let store = Arc::new(InMemoryCredentialStore::default());
        store
            .save_token("user-1", &token_expiring_at(now))
            .expect("save token");
        let client = Arc::new(FakeOAuthHttpClient::default());
        client.set_refresh_response(FakeResponse::Rejected("invalid_grant".to_string()));

        let result = manager_at(now, &store, &client).get_valid_token("user-1").await;
        assert!(matches!(result, Err(EngineError::Auth(message)) if message.contains("reauthentication")));
    }

    #[tokio::test]
    async fn unreachable_token_endpoint_is_a_network_error() {
        let now = fixed_time("2025-01-06T09:00:00Z");
        let store = Arc::new(InMemoryCredentialStore::default());
        store
            .save_token("user-1", &token_expiring_at(now))
            .expect("save token");
        let client = Arc::new(FakeOAuthHttpClient::default());
        client.set_refresh_response(FakeResponse::Unavailable);

        let result = manager_at(now, &store, &client).get_valid_token("user-1").await;
        assert!(matches!(result, Err(EngineError::Network(_))));
    }

    #[tokio::test]
    async fn missing_credential_is_an_auth_error() {
        let store = Arc::new(InMemoryCredentialStore::default());
        let client = Arc::new(FakeOAuthHttpClient::default());
        let manager = manager_at(fixed_time("2025-01-06T09:00:00Z"), &store, &client);

        let result = manager.get_valid_token("user-1").await;
        assert!(matches!(result, Err(EngineError::Auth(_))));
    }

    #[tokio::test]
    async fn connect_then_revoke_invalidates_outstanding_grants() {
        let now = fixed_time("2025-01-06T09:00:00Z");
        let store = Arc::new(InMemoryCredentialStore::default());
        let client = Arc::new(FakeOAuthHttpClient::default());
        client.set_exchange_response(FakeResponse::default());
        let manager = manager_at(now, &store, &client);

        let grant = manager
            .connect_with_code("user-1", "sample-code")
            .await
            .expect("connect");
        assert!(manager.is_grant_current("user-1", &grant).expect("check"));
        assert!(store.load_token("user-1").expect("load").is_some());

        assert!(manager.revoke("user-1").expect("revoke"));
        assert!(!manager.is_grant_current("user-1", &grant).expect("check"));
        assert!(store.load_token("user-1").expect("load").is_none());
        assert!(!manager.revoke("user-1").expect("second revoke"));
        assert!(matches!(
            manager.get_valid_token("user-1").await,
            Err(EngineError::Auth(_))
        ));
    }

    type RevokingManager = TokenManager<RevokingStore, FakeOAuthHttpClient>;

    /// Starts a revoke from another thread while the refreshed token is being saved.
    #[derive(Default)]
    struct RevokingStore {
        inner: InMemoryCredentialStore,
        manager: OnceLock<Weak<RevokingManager>>,
        armed: AtomicBool,
        revoker: Mutex<Option<thread::JoinHandle<()>>>,
    }

    impl CredentialStore for RevokingStore {
        fn save_token(&self, owner_id: &str, token: &OAuthToken) -> Result<(), EngineError> {
            let manager = self.manager.get().and_then(Weak::upgrade);
            if let Some(manager) = manager.filter(|_| self.armed.swap(false, Ordering::SeqCst)) {
                let (done_sender, done_receiver) = mpsc::channel();
                let owner_id = owner_id.to_string();
                let revoker = thread::spawn(move || {
                    manager.revoke(&owner_id).expect("revoke");
                    let _ = done_sender.send(());
                });
                *self.revoker.lock().expect("revoker") = Some(revoker);
                let _ = done_receiver.recv_timeout(std::time::Duration::from_millis(50));
            }
            self.inner.save_token(owner_id, token)
        }

        fn load_token(&self, owner_id: &str) -> Result<Option<OAuthToken>, EngineError> {
            self.inner.load_token(owner_id)
        }

        fn delete_token(&self, owner_id: &str) -> Result<bool, EngineError> {
            self.inner.delete_token(owner_id)
        }
    }

    #[tokio::test]
    async fn revoke_during_refresh_save_leaves_no_credential() {
        let now = fixed_time("2025-01-06T09:00:00Z");
        let store = Arc::new(RevokingStore::default());
        store
            .save_token("user-1", &token_expiring_at(now - Duration::seconds(60)))
            .expect("save token");
        let client = Arc::new(FakeOAuthHttpClient::default());
        let manager: Arc<RevokingManager> = Arc::new(
            TokenManager::new(test_config(), Arc::clone(&store), client)
                .with_now_provider(Arc::new(move || now)),
        );
        assert!(store.manager.set(Arc::downgrade(&manager)).is_ok());
        store.armed.store(true, Ordering::SeqCst);

        let grant = manager.get_valid_token("user-1").await.expect("grant");
        let revoker = store.revoker.lock().expect("revoker").take().expect("revoke started");
        revoker.join().expect("revoke thread");

        assert!(store.load_token("user-1").expect("load").is_none());
        assert!(!manager.is_grant_current("user-1", &grant).expect("check"));
    }

    #[test]
    fn authorization_url_carries_offline_consent() {
        let store = Arc::new(InMemoryCredentialStore::default());
        let client = Arc::new(FakeOAuthHttpClient::default());
        let manager = TokenManager::new(test_config(), store, client);

        let url = manager.authorization_url("state-123").expect("url");
        let parsed = Url::parse(&url).expect("valid url");
        let pairs = parsed.query_pairs().into_owned().collect::<HashMap<_, _>>();
        assert_eq!(pairs.get("state").map(String::as_str), Some("state-123"));
        assert_eq!(pairs.get("access_type").map(String::as_str), Some("offline"));
        assert_eq!(
            pairs.get("scope").map(String::as_str),
            Some("https://www.googleapis.com/auth/calendar openid")
        );
        assert!(manager.authorization_url("  ").is_err());
    }
}
