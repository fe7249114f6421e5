use crate::application::bootstrap::bootstrap_workspace;
use crate::application::calendar_sync::{
    RetryPolicy, SyncCancellation, SyncReconciler, SyncResult,
};
use crate::application::expansion_scheduler::{ExpansionScheduler, SchedulerHandle, SweepReport};
use crate::application::token_manager::{NowProvider, TokenManager};
use crate::application::user_locks::UserLocks;
use crate::domain::recurrence::ExpansionPolicy;
use crate::infrastructure::config::{EngineConfig, OAuthConfig, load_oauth_config_from_env};
use crate::infrastructure::credential_store::{CredentialStore, KeyringCredentialStore};
use crate::infrastructure::error::EngineError;
use crate::infrastructure::google_calendar_client::{CalendarClient, ReqwestGoogleCalendarClient};
use crate::infrastructure::item_repository::{ItemRepository, SqliteItemRepository};
use crate::infrastructure::logging::init_logging;
use crate::infrastructure::oauth_client::{OAuthHttpClient, ReqwestOAuthClient};
use crate::infrastructure::sync_state_repository::{
    SqliteSyncStateRepository, SyncStateRepository,
};
use chrono::Utc;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

pub type ProductionEngine = Engine<
    SqliteItemRepository,
    SqliteSyncStateRepository,
    ReqwestGoogleCalendarClient,
    KeyringCredentialStore,
    ReqwestOAuthClient,
>;

/// Storage and network capabilities an engine is assembled from.
pub struct EngineComponents<R, S, C, K, O> {
    pub item_repository: Arc<R>,
    pub sync_state_repository: Arc<S>,
    pub calendar_client: Arc<C>,
    pub credential_store: Arc<K>,
    pub oauth_client: Arc<O>,
    pub now_provider: NowProvider,
}

impl<R, S, C, K, O> EngineComponents<R, S, C, K, O> {
    pub fn new(
        item_repository: Arc<R>,
        sync_state_repository: Arc<S>,
        calendar_client: Arc<C>,
        credential_store: Arc<K>,
        oauth_client: Arc<O>,
    ) -> Self {
        Self {
            item_repository,
            sync_state_repository,
            calendar_client,
            credential_store,
            oauth_client,
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }
}

pub struct Engine<R, S, C, K, O>
where
    R: ItemRepository + 'static,
    S: SyncStateRepository,
    C: CalendarClient,
    K: CredentialStore,
    O: OAuthHttpClient,
{
    item_repository: Arc<R>,
    sync_state_repository: Arc<S>,
    token_manager: Arc<TokenManager<K, O>>,
    reconciler: SyncReconciler<R, S, C, TokenManager<K, O>>,
    scheduler: Arc<ExpansionScheduler<R>>,
    active_scheduler: Mutex<Option<SchedulerHandle>>,
    default_interval_minutes: u64,
}

impl ProductionEngine {
    /// Bootstraps `workspace_root`, installs file logging and wires the SQLite,
    /// keyring and Google Calendar implementations.
    pub fn open(workspace_root: &Path) -> Result<Self, EngineError> {
        let bootstrap = bootstrap_workspace(workspace_root)?;
        if !init_logging(&bootstrap.logs_dir)? {
            debug!("global tracing subscriber already installed");
        }
        let oauth_config = load_oauth_config_from_env()?;

        let components = EngineComponents::new(
            Arc::new(SqliteItemRepository::new(&bootstrap.database_path)),
            Arc::new(SqliteSyncStateRepository::new(&bootstrap.database_path)),
            Arc::new(ReqwestGoogleCalendarClient::new()),
            Arc::new(KeyringCredentialStore::default()),
            Arc::new(ReqwestOAuthClient::new()),
        );
        let engine = Self::new(&bootstrap.config, oauth_config, components)?;
        info!(
            workspace_root = %bootstrap.workspace_root.display(),
            database = %bootstrap.database_path.display(),
            "engine opened"
        );
        Ok(engine)
    }
}

impl<R, S, C, K, O> Engine<R, S, C, K, O>
where
    R: ItemRepository + 'static,
    S: SyncStateRepository,
    C: CalendarClient,
    K: CredentialStore,
    O: OAuthHttpClient,
{
    pub fn new(
        config: &EngineConfig,
        oauth_config: OAuthConfig,
        components: EngineComponents<R, S, C, K, O>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let EngineComponents {
            item_repository,
            sync_state_repository,
            calendar_client,
            credential_store,
            oauth_client,
            now_provider,
        } = components;

        let user_locks = Arc::new(UserLocks::new());
        let token_manager = Arc::new(
            TokenManager::new(oauth_config, credential_store, oauth_client)
                .with_refresh_margin_seconds(config.sync.token_refresh_margin_seconds)
                .with_now_provider(Arc::clone(&now_provider)),
        );
        let reconciler = SyncReconciler::new(
            Arc::clone(&item_repository),
            Arc::clone(&sync_state_repository),
            calendar_client,
            Arc::clone(&token_manager),
            Arc::clone(&user_locks),
        )
        .with_calendar_id(config.sync.calendar_id.clone())
        .with_retry_policy(RetryPolicy {
            max_attempts: config.sync.retry_max_attempts,
            base_delay_ms: config.sync.retry_base_delay_ms,
        })
        .with_now_provider(Arc::clone(&now_provider));

        let policy = ExpansionPolicy {
            look_ahead: chrono::Duration::days(config.expansion.look_ahead_days),
            max_occurrences_per_run: config.expansion.max_occurrences_per_run,
            time_zone: config.time_zone()?,
        };
        let scheduler = Arc::new(
            ExpansionScheduler::new(Arc::clone(&item_repository), user_locks, policy)
                .with_parallel_owners(config.expansion.parallel_owners)
                .with_now_provider(now_provider),
        );

        Ok(Self {
            item_repository,
            sync_state_repository,
            token_manager,
            reconciler,
            scheduler,
            active_scheduler: Mutex::new(None),
            default_interval_minutes: config.expansion.interval_minutes,
        })
    }

    pub fn items(&self) -> &Arc<R> {
        &self.item_repository
    }

    /// Starts the periodic expansion sweep, replacing any scheduler this
    /// engine started before. Requires a Tokio runtime.
    pub fn trigger_expansion(&self, interval_minutes: u64) -> Result<SchedulerHandle, EngineError> {
        let interval = Duration::from_secs(interval_minutes.saturating_mul(60));
        let mut active = self
            .active_scheduler
            .lock()
            .map_err(|error| EngineError::Persistence(format!("scheduler slot poisoned: {error}")))?;
        let handle = Arc::clone(&self.scheduler).start(interval)?;
        if let Some(previous) = active.replace(handle.clone()) {
            previous.stop();
            info!(interval_minutes, "expansion scheduler replaced");
        }
        Ok(handle)
    }

    /// `trigger_expansion` with the configured interval.
    pub fn start_expansion(&self) -> Result<SchedulerHandle, EngineError> {
        self.trigger_expansion(self.default_interval_minutes)
    }

    pub async fn run_expansion_now(&self) -> SweepReport {
        self.scheduler.run_sweep().await
    }

    pub async fn request_sync(&self, user_id: &str) -> SyncResult {
        self.reconciler.sync(user_id).await
    }

    pub async fn request_sync_with_cancel(
        &self,
        user_id: &str,
        cancellation: &SyncCancellation,
    ) -> SyncResult {
        self.reconciler.sync_with_cancel(user_id, cancellation).await
    }

    pub fn authorization_url(&self, state: &str) -> Result<String, EngineError> {
        self.token_manager.authorization_url(state)
    }

    /// Exchanges an OAuth authorization code and stores the credential. The
    /// next sync for the account starts from a full listing.
    pub async fn connect_account(&self, user_id: &str, code: &str) -> Result<(), EngineError> {
        self.token_manager.connect_with_code(user_id, code).await?;
        self.sync_state_repository.clear(user_id)?;
        info!(user_id, "calendar account connected");
        Ok(())
    }

    /// Revokes the stored credential; returns whether one existed.
    pub fn disconnect(&self, user_id: &str) -> Result<bool, EngineError> {
        let existed = self.token_manager.revoke(user_id)?;
        self.sync_state_repository.clear(user_id)?;
        Ok(existed)
    }

    pub fn shutdown(&self) {
        let active = match self.active_scheduler.lock() {
            Ok(mut active) => active.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = active {
            handle.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::token_manager::tests::{FakeOAuthHttpClient, fixed_time, test_config};
    use crate::domain::models::{ItemKind, ItemSource, ScheduleItem};
    use crate::infrastructure::credential_store::InMemoryCredentialStore;
    use crate::infrastructure::google_calendar_client::{ListEventsRequest, ListEventsResponse};
    use crate::infrastructure::item_repository::InMemoryItemRepository;
    use crate::infrastructure::sync_state_repository::InMemorySyncStateRepository;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct RecordingCalendar {
        created: AtomicUsize,
    }

    #[async_trait]
    impl CalendarClient for RecordingCalendar {
        async fn list_events(
            &self,
            _access_token: &str,
            _calendar_id: &str,
            _request: ListEventsRequest,
        ) -> Result<ListEventsResponse, EngineError> {
            Ok(ListEventsResponse {
                next_sync_token: Some("token-1".to_string()),
                ..ListEventsResponse::default()
            })
        }

        async fn create_event(
            &self,
            _access_token: &str,
            _calendar_id: &str,
            _item: &ScheduleItem,
        ) -> Result<String, EngineError> {
            let sequence = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("remote-{sequence}"))
        }

        async fn update_event(
            &self,
            _access_token: &str,
            _calendar_id: &str,
            _external_id: &str,
            _item: &ScheduleItem,
        ) -> Result<(), EngineError> {
            Ok(())
        }
    }

    type TestEngine = Engine<
        InMemoryItemRepository,
        InMemorySyncStateRepository,
        RecordingCalendar,
        InMemoryCredentialStore,
        FakeOAuthHttpClient,
    >;

    struct Harness {
        engine: TestEngine,
        sync_state: Arc<InMemorySyncStateRepository>,
        calendar: Arc<RecordingCalendar>,
    }

    fn harness() -> Harness {
        let now = fixed_time("2025-01-06T12:00:00Z");
        let sync_state = Arc::new(InMemorySyncStateRepository::default());
        let calendar = Arc::new(RecordingCalendar::default());
        let components = EngineComponents::new(
            Arc::new(InMemoryItemRepository::default()),
            Arc::clone(&sync_state),
            Arc::clone(&calendar),
            Arc::new(InMemoryCredentialStore::default()),
            Arc::new(FakeOAuthHttpClient::default()),
        )
        .with_now_provider(Arc::new(move || now));
        let engine = Engine::new(&EngineConfig::default(), test_config(), components).expect("engine");
        Harness {
            engine,
            sync_state,
            calendar,
        }
    }

    fn local_event(id: &str) -> ScheduleItem {
        let start_at = fixed_time("2025-01-07T09:00:00Z");
        ScheduleItem {
            id: id.to_string(),
            owner_id: "user-1".to_string(),
            kind: ItemKind::Event,
            title: "Planning".to_string(),
            description: None,
            start_at,
            end_at: Some(start_at + chrono::Duration::hours(1)),
            recurrence: None,
            parent_id: None,
            source: ItemSource::Local,
            external_id: None,
            last_updated_at: fixed_time("2025-01-06T08:00:00Z"),
            synced_at: None,
            created_at: fixed_time("2025-01-06T08:00:00Z"),
        }
    }

    #[tokio::test]
    async fn connect_sync_and_disconnect_flow() {
        let harness = harness();
        let engine = &harness.engine;
        engine.items().insert(&local_event("itm-1")).expect("insert");

        let unconnected = engine.request_sync("user-1").await;
        assert!(!unconnected.success);

        engine.connect_account("user-1", "auth-code").await.expect("connect");
        let synced = engine.request_sync("user-1").await;
        assert!(synced.success, "{synced:?}");
        assert_eq!(synced.pushed, 1);
        assert_eq!(harness.calendar.created.load(Ordering::SeqCst), 1);
        assert!(harness.sync_state.load("user-1").expect("load").is_some());

        assert!(engine.disconnect("user-1").expect("disconnect"));
        assert!(!engine.disconnect("user-1").expect("second disconnect"));
        assert_eq!(harness.sync_state.load("user-1").expect("load"), None);

        let after = engine.request_sync("user-1").await;
        assert!(!after.success);
        assert!(after.error.as_deref().is_some_and(|error| error.contains("authentication")));
    }

    #[tokio::test(start_paused = true)]
    async fn triggering_expansion_again_replaces_the_scheduler() {
        let harness = harness();
        let first = harness.engine.trigger_expansion(60).expect("first scheduler");
        let second = harness.engine.trigger_expansion(30).expect("second scheduler");

        assert!(first.is_stopped());
        first.stopped().await;
        assert!(!second.is_stopped());

        harness.engine.shutdown();
        assert!(second.is_stopped());
        second.stopped().await;
        assert!(harness.engine.trigger_expansion(0).is_err());
    }

    #[test]
    fn authorization_url_carries_state() {
        let harness = harness();
        let url = harness
            .engine
            .authorization_url("csrf-state")
            .expect("authorization url");
        assert!(url.contains("state=csrf-state"));
    }
}
