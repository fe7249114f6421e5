use crate::application::token_manager::{AccessGrant, AccessTokenProvider, NowProvider};
use crate::application::user_locks::UserLocks;
use crate::domain::models::{ItemKind, ItemSource, RemoteItem, ScheduleItem};
use crate::infrastructure::error::{EngineError, ErrorCategory};
use crate::infrastructure::google_calendar_client::{
    CalendarClient, ListEventsRequest, ListEventsResponse,
};
use crate::infrastructure::item_repository::ItemRepository;
use crate::infrastructure::sync_state_repository::SyncStateRepository;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::time::{Duration as TokioDuration, sleep};
use tracing::{debug, info, warn};

pub const SYNC_BUSY_MESSAGE: &str = "sync already in progress";
pub const SYNC_CANCELLED_MESSAGE: &str = "sync cancelled";
const DEFAULT_CALENDAR_ID: &str = "primary";

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id(prefix: &str) -> String {
    let sequence = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{sequence}", Utc::now().timestamp_micros())
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> TokioDuration {
        TokioDuration::from_millis(
            self.base_delay_ms
                .saturating_mul(2u64.saturating_pow(attempt)),
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    RemoteWins,
    LocalWins,
}

/// Both copies changed since the last reconciliation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConflictRecord {
    pub item_id: String,
    pub external_id: String,
    pub local_updated_at: DateTime<Utc>,
    pub remote_updated_at: DateTime<Utc>,
    pub resolution: ConflictResolution,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ItemFailure {
    pub item_id: Option<String>,
    pub external_id: Option<String>,
    pub category: ErrorCategory,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SyncResult {
    pub success: bool,
    pub imported: usize,
    pub pushed: usize,
    pub removed: usize,
    pub conflicts: Vec<ConflictRecord>,
    pub failures: Vec<ItemFailure>,
    pub error: Option<String>,
}

impl SyncResult {
    pub fn busy() -> Self {
        Self {
            error: Some(SYNC_BUSY_MESSAGE.to_string()),
            ..Self::default()
        }
    }

    pub fn is_busy(&self) -> bool {
        !self.success && self.error.as_deref() == Some(SYNC_BUSY_MESSAGE)
    }
}

/// Cooperative cancellation for one sync pass. Clones share state.
#[derive(Debug, Clone)]
pub struct SyncCancellation {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for SyncCancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncCancellation {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        let sender_gone = receiver.wait_for(|cancelled| *cancelled).await.is_err();
        if sender_gone {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Default)]
struct PassOutcome {
    imported: usize,
    pushed: usize,
    removed: usize,
    conflicts: Vec<ConflictRecord>,
    failures: Vec<ItemFailure>,
}

impl PassOutcome {
    fn into_result(self, error: Option<&EngineError>) -> SyncResult {
        SyncResult {
            success: error.is_none(),
            imported: self.imported,
            pushed: self.pushed,
            removed: self.removed,
            conflicts: self.conflicts,
            failures: self.failures,
            error: error.map(|error| match error {
                EngineError::Cancelled => SYNC_CANCELLED_MESSAGE.to_string(),
                other => other.to_string(),
            }),
        }
    }

    fn record_failure(
        &mut self,
        item_id: Option<&str>,
        external_id: Option<&str>,
        error: &EngineError,
    ) {
        self.failures.push(ItemFailure {
            item_id: item_id.map(ToOwned::to_owned),
            external_id: external_id.map(ToOwned::to_owned),
            category: error.category(),
            message: error.to_string(),
        });
    }
}

struct Pass<'a> {
    user_id: &'a str,
    grant: AccessGrant,
    cancellation: &'a SyncCancellation,
    now: DateTime<Utc>,
}

pub struct SyncReconciler<R, S, C, A>
where
    R: ItemRepository,
    S: SyncStateRepository,
    C: CalendarClient,
    A: AccessTokenProvider,
{
    item_repository: Arc<R>,
    sync_state_repository: Arc<S>,
    calendar_client: Arc<C>,
    token_provider: Arc<A>,
    user_locks: Arc<UserLocks>,
    calendar_id: String,
    retry_policy: RetryPolicy,
    now_provider: NowProvider,
}

impl<R, S, C, A> SyncReconciler<R, S, C, A>
where
    R: ItemRepository,
    S: SyncStateRepository,
    C: CalendarClient,
    A: AccessTokenProvider,
{
    pub fn new(
        item_repository: Arc<R>,
        sync_state_repository: Arc<S>,
        calendar_client: Arc<C>,
        token_provider: Arc<A>,
        user_locks: Arc<UserLocks>,
    ) -> Self {
        Self {
            item_repository,
            sync_state_repository,
            calendar_client,
            token_provider,
            user_locks,
            calendar_id: DEFAULT_CALENDAR_ID.to_string(),
            retry_policy: RetryPolicy::default(),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_calendar_id(mut self, calendar_id: impl Into<String>) -> Self {
        self.calendar_id = calendar_id.into();
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub async fn sync(&self, user_id: &str) -> SyncResult {
        self.sync_with_cancel(user_id, &SyncCancellation::new()).await
    }

    /// One bidirectional pass for `user_id`. Never returns an error: fatal
    /// problems are reported through `SyncResult::error`.
    pub async fn sync_with_cancel(
        &self,
        user_id: &str,
        cancellation: &SyncCancellation,
    ) -> SyncResult {
        if user_id.trim().is_empty() {
            let error = EngineError::Validation("user id must not be empty".to_string());
            return PassOutcome::default().into_result(Some(&error));
        }

        let _marker = match self.user_locks.try_begin_sync(user_id) {
            Ok(Some(marker)) => marker,
            Ok(None) => {
                info!(user_id, "sync skipped: another pass is in flight");
                return SyncResult::busy();
            }
            Err(error) => return PassOutcome::default().into_result(Some(&error)),
        };

        let mut outcome = PassOutcome::default();
        let error = self
            .run_pass(user_id, cancellation, &mut outcome)
            .await
            .err();
        match error.as_ref() {
            None => info!(
                user_id,
                imported = outcome.imported,
                pushed = outcome.pushed,
                removed = outcome.removed,
                conflicts = outcome.conflicts.len(),
                failures = outcome.failures.len(),
                "sync pass finished"
            ),
            Some(EngineError::Cancelled) => info!(user_id, "sync pass cancelled"),
            Some(error) => warn!(user_id, %error, category = ?error.category(), "sync pass failed"),
        }
        outcome.into_result(error.as_ref())
    }

    async fn run_pass(
        &self,
        user_id: &str,
        cancellation: &SyncCancellation,
        outcome: &mut PassOutcome,
    ) -> Result<(), EngineError> {
        let _user_guard = race(cancellation, self.user_locks.acquire(user_id)).await?;
        let grant = race(cancellation, self.token_provider.get_valid_token(user_id)).await?;
        let pass = Pass {
            user_id,
            grant,
            cancellation,
            now: (self.now_provider)(),
        };

        self.pull(&pass, outcome).await?;
        self.push(&pass, outcome).await
    }

    /// Issues a remote call unless the pass was cancelled or its credential revoked.
    async fn remote<T, F>(&self, pass: &Pass<'_>, call: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        if !self
            .token_provider
            .is_grant_current(pass.user_id, &pass.grant)?
        {
            return Err(EngineError::Auth(
                "calendar credential revoked during sync".to_string(),
            ));
        }
        race(pass.cancellation, call).await
    }

    async fn pull(&self, pass: &Pass<'_>, outcome: &mut PassOutcome) -> Result<(), EngineError> {
        let previous_token = self
            .sync_state_repository
            .load(pass.user_id)?
            .and_then(|state| state.sync_token);

        let (listing, listed_from) = match self.list_with_retry(pass, previous_token.clone()).await {
            Ok(listing) => (listing, previous_token.clone()),
            Err(EngineError::SyncTokenExpired) if previous_token.is_some() => {
                info!(user_id = pass.user_id, "sync token expired; falling back to full listing");
                (self.list_with_retry(pass, None).await?, None)
            }
            Err(error) => return Err(error),
        };
        debug!(
            user_id = pass.user_id,
            items = listing.items.len(),
            malformed = listing.malformed.len(),
            incremental = previous_token.is_some(),
            "remote listing received"
        );

        for malformed in &listing.malformed {
            let error = EngineError::Validation(malformed.reason.clone());
            outcome.record_failure(None, malformed.external_id.as_deref(), &error);
        }
        let mut unsaved = 0usize;
        for remote in &listing.items {
            if let Err(error) = self.apply_remote(pass, remote, outcome) {
                warn!(
                    user_id = pass.user_id,
                    external_id = %remote.external_id,
                    %error,
                    "failed to apply remote item"
                );
                if error.category() == ErrorCategory::Persistence {
                    unsaved += 1;
                }
                outcome.record_failure(None, Some(&remote.external_id), &error);
            }
        }

        // A local write failure keeps the listing start, so the next pull sees the item again.
        // Invalid remote data would fail the same way forever, so it does not hold the token back.
        let sync_token = if unsaved > 0 {
            warn!(
                user_id = pass.user_id,
                unsaved, "sync token held back after local write failures"
            );
            listed_from.as_deref()
        } else {
            listing.next_sync_token.as_deref()
        };
        self.sync_state_repository
            .save_pull_checkpoint(pass.user_id, sync_token, pass.now)
    }

    async fn list_with_retry(
        &self,
        pass: &Pass<'_>,
        sync_token: Option<String>,
    ) -> Result<ListEventsResponse, EngineError> {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            let request = ListEventsRequest {
                sync_token: sync_token.clone(),
            };
            let listed = self
                .remote(
                    pass,
                    self.calendar_client.list_events(
                        &pass.grant.access_token,
                        &self.calendar_id,
                        request,
                    ),
                )
                .await;
            match listed {
                Ok(response) => return Ok(response),
                Err(error) if error.is_transient() && attempt + 1 < max_attempts => {
                    let delay = self.retry_policy.delay_for(attempt);
                    debug!(user_id = pass.user_id, attempt, ?delay, %error, "retrying event listing");
                    race(pass.cancellation, async {
                        sleep(delay).await;
                        Ok::<(), EngineError>(())
                    })
                    .await?;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn find_local_copy(
        &self,
        user_id: &str,
        remote: &RemoteItem,
    ) -> Result<Option<ScheduleItem>, EngineError> {
        if let Some(local) = self
            .item_repository
            .find_by_external_id(user_id, &remote.external_id)?
        {
            return Ok(Some(local));
        }
        // Pushed earlier, but the returned id never reached the store.
        let Some(local_item_id) = remote.local_item_id.as_deref() else {
            return Ok(None);
        };
        Ok(self
            .item_repository
            .get_by_id(local_item_id)?
            .filter(|item| item.owner_id == user_id && item.external_id.is_none()))
    }

    fn apply_remote(
        &self,
        pass: &Pass<'_>,
        remote: &RemoteItem,
        outcome: &mut PassOutcome,
    ) -> Result<(), EngineError> {
        remote.validate().map_err(EngineError::Validation)?;
        let existing = self.find_local_copy(pass.user_id, remote)?;

        if remote.cancelled {
            if let Some(local) = existing {
                let plain = !local.is_recurring() && !local.is_occurrence();
                if local.source == ItemSource::External && plain {
                    self.item_repository.delete(&local.id)?;
                    outcome.removed += 1;
                    debug!(user_id = pass.user_id, item_id = %local.id, "removed remotely cancelled item");
                }
            }
            return Ok(());
        }

        let Some(local) = existing else {
            let imported = imported_item(pass.user_id, remote, pass.now);
            self.item_repository.insert(&imported)?;
            outcome.imported += 1;
            return Ok(());
        };

        if local.same_content_as(remote) {
            if local.external_id.is_none() || local.is_dirty() {
                let mut linked = local.clone();
                linked.external_id = Some(remote.external_id.clone());
                linked.synced_at = Some(pass.now.max(local.last_updated_at));
                self.item_repository.update(&linked)?;
            }
            return Ok(());
        }

        if !local.is_dirty() {
            self.item_repository
                .update(&overwritten_by(&local, remote, pass.now))?;
            outcome.imported += 1;
            return Ok(());
        }

        let resolution = if remote.updated_at >= local.last_updated_at {
            ConflictResolution::RemoteWins
        } else {
            ConflictResolution::LocalWins
        };
        match resolution {
            ConflictResolution::RemoteWins => {
                self.item_repository
                    .update(&overwritten_by(&local, remote, pass.now))?;
                outcome.imported += 1;
            }
            ConflictResolution::LocalWins if local.external_id.is_none() => {
                let mut linked = local.clone();
                linked.external_id = Some(remote.external_id.clone());
                self.item_repository.update(&linked)?;
            }
            ConflictResolution::LocalWins => {}
        }
        info!(
            user_id = pass.user_id,
            item_id = %local.id,
            external_id = %remote.external_id,
            ?resolution,
            "resolved edit conflict"
        );
        outcome.conflicts.push(ConflictRecord {
            item_id: local.id.clone(),
            external_id: remote.external_id.clone(),
            local_updated_at: local.last_updated_at,
            remote_updated_at: remote.updated_at,
            resolution,
        });
        Ok(())
    }

    async fn push(&self, pass: &Pass<'_>, outcome: &mut PassOutcome) -> Result<(), EngineError> {
        let candidates = self
            .item_repository
            .find_by_owner(pass.user_id)?
            .into_iter()
            .filter(needs_push)
            .collect::<Vec<_>>();

        for item in candidates {
            match self.push_item(pass, &item).await {
                Ok(()) => outcome.pushed += 1,
                Err(error) if aborts_pass(&error) => return Err(error),
                Err(error) => {
                    warn!(user_id = pass.user_id, item_id = %item.id, %error, "failed to push item");
                    outcome.record_failure(Some(&item.id), item.external_id.as_deref(), &error);
                }
            }
        }

        self.sync_state_repository
            .save_push_checkpoint(pass.user_id, pass.now)
    }

    async fn push_item(&self, pass: &Pass<'_>, item: &ScheduleItem) -> Result<(), EngineError> {
        let external_id = match item.external_id.as_deref() {
            Some(external_id) => {
                self.remote(
                    pass,
                    self.calendar_client.update_event(
                        &pass.grant.access_token,
                        &self.calendar_id,
                        external_id,
                        item,
                    ),
                )
                .await?;
                external_id.to_string()
            }
            None => {
                self.remote(
                    pass,
                    self.calendar_client.create_event(
                        &pass.grant.access_token,
                        &self.calendar_id,
                        item,
                    ),
                )
                .await?
            }
        };

        let mut synced = item.clone();
        synced.external_id = Some(external_id);
        synced.synced_at = Some(pass.now.max(item.last_updated_at));
        self.item_repository.update(&synced)
    }
}

async fn race<T, F>(cancellation: &SyncCancellation, future: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    if cancellation.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(EngineError::Cancelled),
        result = future => result,
    }
}

fn needs_push(item: &ScheduleItem) -> bool {
    match item.external_id {
        None => item.source == ItemSource::Local,
        Some(_) => item.is_dirty(),
    }
}

fn aborts_pass(error: &EngineError) -> bool {
    matches!(
        error.category(),
        ErrorCategory::Cancelled | ErrorCategory::Auth
    )
}

fn imported_item(user_id: &str, remote: &RemoteItem, now: DateTime<Utc>) -> ScheduleItem {
    ScheduleItem {
        id: next_id("ext"),
        owner_id: user_id.to_string(),
        kind: remote.kind.unwrap_or(ItemKind::Event),
        title: remote.title.clone(),
        description: remote.description.clone(),
        start_at: remote.start_at,
        end_at: Some(remote.end_at),
        recurrence: None,
        parent_id: None,
        source: ItemSource::External,
        external_id: Some(remote.external_id.clone()),
        last_updated_at: remote.updated_at,
        synced_at: Some(now.max(remote.updated_at)),
        created_at: now,
    }
}

fn overwritten_by(local: &ScheduleItem, remote: &RemoteItem, now: DateTime<Utc>) -> ScheduleItem {
    let mut updated = local.clone();
    updated.title = remote.title.clone();
    updated.description = remote.description.clone();
    updated.start_at = remote.start_at;
    updated.end_at = if local.end_at.is_none() && remote.end_at == remote.start_at {
        None
    } else {
        Some(remote.end_at)
    };
    if let Some(kind) = remote.kind {
        updated.kind = kind;
    }
    updated.external_id = Some(remote.external_id.clone());
    updated.last_updated_at = remote.updated_at.max(local.last_updated_at);
    updated.synced_at = Some(now.max(updated.last_updated_at));
    updated
}
