use crate::application::calendar_sync::ItemFailure;
use crate::application::token_manager::NowProvider;
use crate::application::user_locks::UserLocks;
use crate::domain::models::ScheduleItem;
use crate::domain::recurrence::{ExpansionPolicy, expand};
use crate::infrastructure::error::{EngineError, ErrorCategory};
use crate::infrastructure::item_repository::ItemRepository;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const DEFAULT_PARALLEL_OWNERS: usize = 4;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    /// Another sweep was still running; nothing was done.
    pub skipped: bool,
    pub owners_processed: usize,
    pub definitions_processed: usize,
    pub occurrences_created: usize,
    pub definitions_refreshed: usize,
    pub definitions_exhausted: usize,
    pub failures: Vec<ItemFailure>,
}

impl SweepReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    fn merge(&mut self, other: SweepReport) {
        self.owners_processed += other.owners_processed;
        self.definitions_processed += other.definitions_processed;
        self.occurrences_created += other.occurrences_created;
        self.definitions_refreshed += other.definitions_refreshed;
        self.definitions_exhausted += other.definitions_exhausted;
        self.failures.extend(other.failures);
    }

    fn record_failure(&mut self, item_id: Option<&str>, error: &EngineError) {
        self.failures.push(ItemFailure {
            item_id: item_id.map(ToOwned::to_owned),
            external_id: None,
            category: error.category(),
            message: error.to_string(),
        });
    }
}

#[derive(Debug, Default)]
struct AppliedExpansion {
    created: usize,
    refreshed: bool,
    exhausted: bool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ExpansionScheduler<R>
where
    R: ItemRepository + 'static,
{
    item_repository: Arc<R>,
    user_locks: Arc<UserLocks>,
    policy: ExpansionPolicy,
    parallel_owners: usize,
    now_provider: NowProvider,
    running: AtomicBool,
    completed_sweeps: AtomicU64,
}

impl<R> ExpansionScheduler<R>
where
    R: ItemRepository + 'static,
{
    pub fn new(item_repository: Arc<R>, user_locks: Arc<UserLocks>, policy: ExpansionPolicy) -> Self {
        Self {
            item_repository,
            user_locks,
            policy,
            parallel_owners: DEFAULT_PARALLEL_OWNERS,
            now_provider: Arc::new(Utc::now),
            running: AtomicBool::new(false),
            completed_sweeps: AtomicU64::new(0),
        }
    }

    pub fn with_parallel_owners(mut self, parallel_owners: usize) -> Self {
        self.parallel_owners = parallel_owners.max(1);
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn completed_sweeps(&self) -> u64 {
        self.completed_sweeps.load(Ordering::Acquire)
    }

    pub fn is_sweeping(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Expands every active definition of every owner once.
    pub async fn run_sweep(&self) -> SweepReport {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("expansion sweep skipped: previous sweep still running");
            return SweepReport::skipped();
        }
        let _running = RunningGuard(&self.running);
        let mut report = SweepReport::default();

        let owner_ids = match self.item_repository.list_owner_ids() {
            Ok(owner_ids) => owner_ids,
            Err(error) => {
                error!(%error, "expansion sweep could not list owners");
                report.record_failure(None, &error);
                self.completed_sweeps.fetch_add(1, Ordering::AcqRel);
                return report;
            }
        };

        let mut owner_tasks = JoinSet::new();
        for owner_id in owner_ids {
            while owner_tasks.len() >= self.parallel_owners {
                if let Some(joined) = owner_tasks.join_next().await {
                    absorb_owner_task(&mut report, joined);
                }
            }
            owner_tasks.spawn(sweep_owner(
                Arc::clone(&self.item_repository),
                Arc::clone(&self.user_locks),
                self.policy.clone(),
                owner_id,
                Arc::clone(&self.now_provider),
            ));
        }
        while let Some(joined) = owner_tasks.join_next().await {
            absorb_owner_task(&mut report, joined);
        }

        self.completed_sweeps.fetch_add(1, Ordering::AcqRel);
        info!(
            owners = report.owners_processed,
            definitions = report.definitions_processed,
            created = report.occurrences_created,
            refreshed = report.definitions_refreshed,
            exhausted = report.definitions_exhausted,
            failures = report.failures.len(),
            "expansion sweep finished"
        );
        report
    }

    /// Runs a sweep now and then every `interval` until the handle is stopped.
    pub fn start(self: Arc<Self>, interval: Duration) -> Result<SchedulerHandle, EngineError> {
        if interval.is_zero() {
            return Err(EngineError::Validation(
                "expansion interval must be greater than zero".to_string(),
            ));
        }

        let (stop_sender, mut stop_receiver) = watch::channel(false);
        let (done_sender, done_receiver) = watch::channel(false);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = interval.as_secs(), "expansion scheduler started");

            loop {
                tokio::select! {
                    biased;
                    changed = stop_receiver.changed() => {
                        if changed.is_err() || *stop_receiver.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.run_sweep().await;
                    }
                }
            }

            info!("expansion scheduler stopped");
            done_sender.send_replace(true);
        });

        Ok(SchedulerHandle {
            stop: Arc::new(stop_sender),
            done: done_receiver,
        })
    }
}

fn absorb_owner_task(report: &mut SweepReport, joined: Result<SweepReport, tokio::task::JoinError>) {
    match joined {
        Ok(owner_report) => report.merge(owner_report),
        Err(join_error) => {
            error!(%join_error, "owner expansion task failed");
            report.failures.push(ItemFailure {
                item_id: None,
                external_id: None,
                category: ErrorCategory::Persistence,
                message: format!("owner expansion task failed: {join_error}"),
            });
        }
    }
}

async fn sweep_owner<R>(
    item_repository: Arc<R>,
    user_locks: Arc<UserLocks>,
    policy: ExpansionPolicy,
    owner_id: String,
    now_provider: NowProvider,
) -> SweepReport
where
    R: ItemRepository,
{
    let mut report = SweepReport::default();
    let _owner_guard = match user_locks.acquire(&owner_id).await {
        Ok(guard) => guard,
        Err(error) => {
            report.record_failure(None, &error);
            return report;
        }
    };
    // Read after the lock so a sync that ran while we waited is in the past.
    let as_of = now_provider();
    let items = match item_repository.find_by_owner(&owner_id) {
        Ok(items) => items,
        Err(error) => {
            warn!(owner_id = %owner_id, %error, "could not load items for expansion");
            report.record_failure(None, &error);
            return report;
        }
    };
    report.owners_processed = 1;

    for definition in items.iter().filter(|item| item.is_active_definition()) {
        report.definitions_processed += 1;
        let existing = items
            .iter()
            .filter(|item| item.parent_id.as_deref() == Some(definition.id.as_str()))
            .cloned()
            .collect::<Vec<_>>();

        match apply_expansion(item_repository.as_ref(), definition, &existing, as_of, &policy) {
            Ok(applied) => {
                report.occurrences_created += applied.created;
                report.definitions_refreshed += usize::from(applied.refreshed);
                report.definitions_exhausted += usize::from(applied.exhausted);
            }
            Err(error) => {
                warn!(owner_id = %owner_id, item_id = %definition.id, %error, "expansion failed for definition");
                report.record_failure(Some(&definition.id), &error);
            }
        }
    }
    report
}

fn apply_expansion<R>(
    item_repository: &R,
    definition: &ScheduleItem,
    existing: &[ScheduleItem],
    as_of: DateTime<Utc>,
    policy: &ExpansionPolicy,
) -> Result<AppliedExpansion, EngineError>
where
    R: ItemRepository + ?Sized,
{
    let plan = expand(definition, existing, as_of, policy).map_err(EngineError::Validation)?;
    let mut applied = AppliedExpansion {
        exhausted: plan.exhausted,
        ..AppliedExpansion::default()
    };
    if plan.is_noop() {
        return Ok(applied);
    }

    for occurrence in &plan.occurrences_to_create {
        item_repository.insert(occurrence)?;
        applied.created += 1;
    }

    match plan.occurrence_to_refresh {
        Some(refreshed) => {
            item_repository.update(&refreshed)?;
            applied.refreshed = true;
        }
        None if plan.exhausted => {
            // Marking inert is bookkeeping, not an edit; leave last_updated_at alone.
            let mut inert = definition.clone();
            if let Some(recurrence) = inert.recurrence.as_mut() {
                recurrence.inert = true;
            }
            item_repository.update(&inert)?;
        }
        None => {}
    }

    if applied.exhausted {
        info!(owner_id = %definition.owner_id, item_id = %definition.id, "recurring series exhausted");
    }
    Ok(applied)
}

/// Controls a running scheduler loop. Clones share the same loop; the loop also
/// ends once every handle is dropped.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    stop: Arc<watch::Sender<bool>>,
    done: watch::Receiver<bool>,
}

impl SchedulerHandle {
    /// Prevents future ticks. A sweep already running finishes normally.
    pub fn stop(&self) {
        if !self.stop.send_replace(true) {
            debug!("expansion scheduler stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolves once the loop has exited.
    pub async fn stopped(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|done| *done).await;
    }
}
