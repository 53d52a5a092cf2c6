//! # Update Handler
//!
//! The execution engine for one slug. A handler owns the catalog built from
//! the registered routines, the completion ledger and the collaborators the
//! state lives in, and drives every routine invocation through the same
//! state machine:
//!
//! * `Done` records the routine in the ledger and, when it is the last
//!   routine of its version, advances the version marker
//! * `Continue` leaves the ledger alone and schedules another pass
//! * `Failed`, an `Err` or a panic is reported as a fault and retried later
//!
//! ## Scheduling
//!
//! [`UpdateHandler::update`] only enqueues work. The host's worker claims due
//! tasks from its scheduler and hands each payload's `update_callback` to
//! [`UpdateHandler::run`].

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt as _;

use crate::{
    Result, UpgradeError,
    catalog::MigrationCatalog,
    config::UpgradeConfig,
    db_version_key,
    hooks::{ConsoleFaultSink, FaultSink, LogFaultSink, UpdateHooks},
    ledger::CompletionLedger,
    plan::UpgradePlan,
    routine::{RoutineDescriptor, RoutineOutcome, UpgradeRoutine},
    run_task_name,
    scheduler::{Scheduler, TaskPayload},
    store::OptionStore,
    task_group,
    version::Version,
};

/// Where a single routine invocation ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    /// The routine finished and its completion was recorded.
    Succeeded,
    /// The routine faulted. Carries the fault message.
    Failed(String),
    /// The routine asked for another pass.
    PendingRetry,
    /// No routine with that id is cataloged.
    Unknown,
}

impl RunState {
    /// `true` unless the invocation faulted or named an unknown routine.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Succeeded | Self::PendingRetry)
    }

    const fn needs_retry(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::PendingRetry)
    }
}

/// Collects routines, hooks and a fault sink for an [`UpdateHandler`].
pub struct UpdateHandlerBuilder {
    config: UpgradeConfig,
    routines: Vec<UpgradeRoutine>,
    hooks: UpdateHooks,
    fault_sink: Option<Arc<dyn FaultSink>>,
}

impl UpdateHandlerBuilder {
    #[must_use]
    pub fn routine(mut self, routine: UpgradeRoutine) -> Self {
        self.routines.push(routine);
        self
    }

    #[must_use]
    pub fn routines(mut self, routines: impl IntoIterator<Item = UpgradeRoutine>) -> Self {
        self.routines.extend(routines);
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: UpdateHooks) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn fault_sink(mut self, fault_sink: Arc<dyn FaultSink>) -> Self {
        self.fault_sink = Some(fault_sink);
        self
    }

    /// Build the catalog and load the ledger.
    ///
    /// # Errors
    ///
    /// * If the config is invalid
    /// * If the ledger fails to load
    pub async fn build(
        self,
        store: Arc<dyn OptionStore>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<UpdateHandler> {
        self.config.validate()?;

        let schema_version = Version::parse(self.config.db_version())?;
        let catalog = MigrationCatalog::build(self.routines);
        let ledger = CompletionLedger::load(&self.config.slug, store.clone()).await?;

        log::debug!(
            "build: '{}' handler with {} routine(s), schema version {schema_version}",
            self.config.slug,
            catalog.len()
        );

        let fault_sink = self
            .fault_sink
            .unwrap_or_else(|| default_fault_sink(&self.config));

        Ok(UpdateHandler {
            config: self.config,
            schema_version,
            catalog,
            ledger,
            store,
            scheduler,
            hooks: self.hooks,
            fault_sink,
            updating: AtomicBool::new(false),
        })
    }
}

/// Plans, schedules and runs the upgrade routines of one slug.
pub struct UpdateHandler {
    config: UpgradeConfig,
    schema_version: Version,
    catalog: MigrationCatalog,
    ledger: CompletionLedger,
    store: Arc<dyn OptionStore>,
    scheduler: Arc<dyn Scheduler>,
    hooks: UpdateHooks,
    fault_sink: Arc<dyn FaultSink>,
    updating: AtomicBool,
}

impl std::fmt::Debug for UpdateHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateHandler")
            .field("config", &self.config)
            .field("catalog", &self.catalog)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl UpdateHandler {
    #[must_use]
    pub fn builder(config: UpgradeConfig) -> UpdateHandlerBuilder {
        UpdateHandlerBuilder {
            config,
            routines: Vec::new(),
            hooks: UpdateHooks::default(),
            fault_sink: None,
        }
    }

    #[must_use]
    pub fn slug(&self) -> &str {
        &self.config.slug
    }

    #[must_use]
    pub const fn config(&self) -> &UpgradeConfig {
        &self.config
    }

    #[must_use]
    pub const fn catalog(&self) -> &MigrationCatalog {
        &self.catalog
    }

    #[must_use]
    pub const fn ledger(&self) -> &CompletionLedger {
        &self.ledger
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn OptionStore> {
        self.store.clone()
    }

    #[must_use]
    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.scheduler.clone()
    }

    /// The data version a fully upgraded installation ends up at.
    #[must_use]
    pub const fn schema_version(&self) -> &Version {
        &self.schema_version
    }

    /// Whether a routine is executing right now.
    #[must_use]
    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::SeqCst)
    }

    /// The persisted version marker, if one was ever written.
    ///
    /// # Errors
    ///
    /// * If the store fails to read the marker
    /// * If the persisted marker is malformed
    pub async fn db_version(&self) -> Result<Option<Version>> {
        Ok(self
            .store
            .get(&db_version_key(self.slug()))
            .await?
            .map(|raw| Version::parse(&raw))
            .transpose()?)
    }

    async fn resolve_current(&self, current: Option<&str>) -> Result<Version> {
        match current {
            Some(current) => Ok(Version::parse(current)?),
            None => Ok(self.db_version().await?.unwrap_or_else(Version::sentinel)),
        }
    }

    /// The routines still needed from `current`, in execution order.
    ///
    /// `None` reads the persisted marker, treating an absent one as `0.0.0`.
    ///
    /// # Errors
    ///
    /// * If `current` or the persisted marker is malformed
    /// * If the store fails to read the marker
    pub async fn plan(&self, current: Option<&str>, force: bool) -> Result<UpgradePlan> {
        let current = self.resolve_current(current).await?;
        let completed = self.ledger.completed_set().await;

        Ok(UpgradePlan::build(&self.catalog, &completed, &current, force))
    }

    /// # Errors
    ///
    /// * If `current` or the persisted marker is malformed
    /// * If the store fails to read the marker
    pub async fn get_needed(
        &self,
        current: Option<&str>,
        force: bool,
    ) -> Result<Vec<RoutineDescriptor>> {
        Ok(self.plan(current, force).await?.into_routines())
    }

    /// # Errors
    ///
    /// * If `current` or the persisted marker is malformed
    /// * If the store fails to read the marker
    pub async fn needs_update(&self, current: Option<&str>) -> Result<bool> {
        Ok(!self.plan(current, false).await?.is_empty())
    }

    /// Schedule every needed routine, one `schedule_spacing` apart in plan
    /// order. Returns the scheduled ids.
    ///
    /// # Errors
    ///
    /// * If the plan fails to build
    /// * If the scheduler rejects a task
    pub async fn update(&self, current: Option<&str>) -> Result<Vec<String>> {
        let plan = self.plan(current, false).await?;
        let now = Utc::now();
        let spacing = self.config.schedule_spacing();

        let mut scheduled = Vec::with_capacity(plan.len());
        for (loop_index, routine) in plan.into_iter().enumerate() {
            let offset = i32::try_from(loop_index).unwrap_or(i32::MAX);
            self.schedule(&routine.method_id, offset_from(now, spacing, offset))
                .await?;
            scheduled.push(routine.method_id);
        }

        log::debug!(
            "update: scheduled {} routine(s) for '{}'",
            scheduled.len(),
            self.slug()
        );

        Ok(scheduled)
    }

    async fn schedule(&self, method_id: &str, run_at: DateTime<Utc>) -> Result<()> {
        self.scheduler
            .schedule(
                run_at,
                &run_task_name(self.slug()),
                &TaskPayload::new(method_id),
                &task_group(self.slug()),
            )
            .await?;

        Ok(())
    }

    /// Whether any routine task for this slug is waiting in the scheduler.
    ///
    /// # Errors
    ///
    /// * If the scheduler fails to query pending tasks
    pub async fn has_scheduled(&self) -> Result<bool> {
        Ok(self
            .scheduler
            .next_scheduled(&run_task_name(self.slug()), &task_group(self.slug()))
            .await?
            .is_some())
    }

    /// Run `method_id` once. Returns `false` on a fault or an unknown id.
    ///
    /// Intended as the scheduler's task entry point: it never returns an
    /// error, faults and unfinished work are retried through the scheduler.
    pub async fn run(&self, method_id: &str) -> bool {
        self.run_routine(method_id).await.is_ok()
    }

    /// Run `method_id` once and schedule a retry unless it succeeded.
    pub async fn run_routine(&self, method_id: &str) -> RunState {
        let state = self.invoke(method_id).await;

        if state.needs_retry() {
            let run_at = offset_from(Utc::now(), self.config.retry_delay(), 1);
            if let Err(e) = self.schedule(method_id, run_at).await {
                log::error!("run_routine: failed to schedule retry of '{method_id}': {e}");
            }
        }

        state
    }

    /// Run `method_id` once without scheduling anything afterwards.
    ///
    /// Faults are still reported and successes still recorded. Used by
    /// callers that drive their own passes, like the CLI.
    pub async fn invoke(&self, method_id: &str) -> RunState {
        let Some(entry) = self.catalog.entry(method_id) else {
            log::warn!(
                "invoke: '{}' has no upgrade routine '{method_id}'",
                self.slug()
            );
            return RunState::Unknown;
        };

        log::debug!("invoke: running '{method_id}'");

        let updating = UpdatingFlag::raise(&self.updating);

        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.hooks.fire_before(method_id);
        })) {
            Ok(()) => AssertUnwindSafe(entry.routine.run())
                .catch_unwind()
                .await
                .map_err(|panic| panic_message("Upgrade routine", panic.as_ref())),
            Err(panic) => Err(panic_message("before_update hook", panic.as_ref())),
        };

        let state = match outcome {
            Ok(Ok(RoutineOutcome::Done)) => self.record_success(method_id).await,
            Ok(Ok(RoutineOutcome::Continue)) => RunState::PendingRetry,
            Ok(Ok(RoutineOutcome::Failed(reason))) => RunState::Failed(reason),
            Ok(Err(e)) => RunState::Failed(e.to_string()),
            Err(message) => RunState::Failed(message),
        };

        drop(updating);

        let success = matches!(state, RunState::Succeeded);
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.hooks.fire_after(method_id, success);
        })) {
            log::error!(
                "invoke: {}",
                panic_message("after_update hook", panic.as_ref())
            );
        }

        match &state {
            RunState::Failed(message) => self.fault_sink.report(method_id, message),
            RunState::PendingRetry => log::debug!("invoke: '{method_id}' needs another pass"),
            RunState::Succeeded => log::debug!("invoke: '{method_id}' completed"),
            RunState::Unknown => {}
        }

        state
    }

    async fn record_success(&self, method_id: &str) -> RunState {
        if let Err(e) = self.ledger.mark_complete(method_id).await {
            return RunState::Failed(format!("Failed to record completion: {e}"));
        }

        if let Some(version) = self.catalog.version_of_last(method_id) {
            if let Err(e) = self.update_db_version(Some(version.as_str())).await {
                return RunState::Failed(format!("Failed to advance version marker: {e}"));
            }
        }

        RunState::Succeeded
    }

    /// Advance the version marker to `version`, or to the configured schema
    /// version when `None`.
    ///
    /// The marker never moves backwards and `0.0.0` is never written.
    /// Returns whether the marker changed.
    ///
    /// # Errors
    ///
    /// * If `version` is malformed
    /// * If the store fails to read or write the marker
    pub async fn update_db_version(&self, version: Option<&str>) -> Result<bool> {
        let version = match version {
            Some(version) => Version::parse(version)?,
            None => self.schema_version.clone(),
        };

        if version.is_sentinel() {
            log::trace!("update_db_version: not writing the sentinel version");
            return Ok(false);
        }

        let key = db_version_key(self.slug());

        if let Some(raw) = self.store.get(&key).await? {
            match Version::parse(&raw) {
                Ok(current) if current >= version => {
                    log::trace!("update_db_version: marker {current} already at or past {version}");
                    return Ok(false);
                }
                Ok(_) => {}
                Err(e) => log::warn!("update_db_version: replacing unreadable marker: {e}"),
            }
        }

        self.store.set(&key, version.as_str()).await?;
        log::debug!("update_db_version: '{}' is now at {version}", self.slug());

        Ok(true)
    }

    /// Look up a cataloged routine, failing with a config error when unknown.
    ///
    /// # Errors
    ///
    /// * If no routine with `method_id` is cataloged
    pub fn require(&self, method_id: &str) -> Result<&RoutineDescriptor> {
        self.catalog
            .get(method_id)
            .ok_or_else(|| UpgradeError::Config(format!("Unknown upgrade routine '{method_id}'")))
    }
}

fn default_fault_sink(config: &UpgradeConfig) -> Arc<dyn FaultSink> {
    if config.interactive {
        Arc::new(ConsoleFaultSink)
    } else {
        Arc::new(LogFaultSink)
    }
}

/// `now + delay * times`, clamped to the latest representable time.
fn offset_from(now: DateTime<Utc>, delay: TimeDelta, times: i32) -> DateTime<Utc> {
    delay
        .checked_mul(times)
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or_else(|| {
            log::warn!("offset_from: {delay} x {times} from {now} overflows, clamping");
            DateTime::<Utc>::MAX_UTC
        })
}

/// Holds the `updating` flag up until dropped.
struct UpdatingFlag<'a>(&'a AtomicBool);

impl<'a> UpdatingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for UpdatingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn panic_message(source: &str, panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .map_or_else(
            || format!("{source} panicked"),
            |message| format!("{source} panicked: {message}"),
        )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        hooks::CollectingFaultSink,
        routine::RoutineError,
        scheduler::memory::MemoryScheduler,
        store::{StoreError, memory::MemoryStore},
    };

    fn done(id: &str, version: &str, priority: i32) -> UpgradeRoutine {
        UpgradeRoutine::new(id, || async { Ok(RoutineOutcome::Done) })
            .version(version)
            .priority(priority)
    }

    async fn handler(
        routines: Vec<UpgradeRoutine>,
        store: Arc<MemoryStore>,
        scheduler: Arc<MemoryScheduler>,
    ) -> UpdateHandler {
        UpdateHandler::builder(UpgradeConfig::new("shop", "1.2.0"))
            .routines(routines)
            .build(store, scheduler)
            .await
            .unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn done_marks_ledger_and_advances_marker_on_last_of_version() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(MemoryScheduler::new());
        let handler = handler(
            vec![done("a", "1.1.0", 10), done("b", "1.1.0", 20)],
            store.clone(),
            scheduler.clone(),
        )
        .await;

        assert_eq!(handler.run_routine("a").await, RunState::Succeeded);
        assert!(handler.ledger().contains("a").await);
        assert_eq!(handler.db_version().await.unwrap(), None);

        assert!(handler.run("b").await);
        assert_eq!(
            handler.db_version().await.unwrap(),
            Some(Version::parse("1.1.0").unwrap())
        );
        assert!(scheduler.pending().await.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn failures_report_and_schedule_a_retry() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(MemoryScheduler::new());
        let sink = Arc::new(CollectingFaultSink::new());
        let handler = UpdateHandler::builder(UpgradeConfig::new("shop", "1.2.0"))
            .routine(
                UpgradeRoutine::new("broken", || async { Err(RoutineError::new("no table")) })
                    .version("1.1.0"),
            )
            .fault_sink(sink.clone())
            .build(store, scheduler.clone())
            .await
            .unwrap();

        let before = Utc::now();
        assert!(!handler.run("broken").await);

        assert_eq!(
            sink.drain(),
            vec![("broken".to_string(), "no table".to_string())]
        );
        assert!(!handler.ledger().contains("broken").await);
        assert_eq!(handler.db_version().await.unwrap(), None);

        let pending = scheduler.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload.update_callback, "broken");
        assert_eq!(pending[0].task_name, "shop_run_update_callback");
        assert_eq!(pending[0].group, "shop-db-updates");
        assert!(pending[0].run_at >= before + chrono::TimeDelta::seconds(1));
    }

    async fn explode() -> crate::routine::RoutineResult {
        panic!("kaboom")
    }

    #[test_log::test(tokio::test)]
    async fn panics_are_faults() {
        let sink = Arc::new(CollectingFaultSink::new());
        let handler = UpdateHandler::builder(UpgradeConfig::new("shop", "1.2.0"))
            .routine(
                UpgradeRoutine::new("explodes", explode).version("1.1.0"),
            )
            .fault_sink(sink.clone())
            .build(Arc::new(MemoryStore::new()), Arc::new(MemoryScheduler::new()))
            .await
            .unwrap();

        let state = handler.run_routine("explodes").await;
        assert_eq!(
            state,
            RunState::Failed("Upgrade routine panicked: kaboom".to_string())
        );
        assert!(!handler.is_updating());
        assert_eq!(sink.drain().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn continue_is_retried_without_a_fault() {
        let scheduler = Arc::new(MemoryScheduler::new());
        let sink = Arc::new(CollectingFaultSink::new());
        let handler = UpdateHandler::builder(UpgradeConfig::new("shop", "1.2.0"))
            .routine(
                UpgradeRoutine::new("batched", || async { Ok(RoutineOutcome::Continue) })
                    .version("1.1.0"),
            )
            .fault_sink(sink.clone())
            .build(Arc::new(MemoryStore::new()), scheduler.clone())
            .await
            .unwrap();

        assert_eq!(handler.run_routine("batched").await, RunState::PendingRetry);
        assert!(handler.run("batched").await);
        assert!(sink.drain().is_empty());
        assert!(!handler.ledger().contains("batched").await);
        assert_eq!(scheduler.pending().await.len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn unknown_ids_are_not_fatal() {
        let scheduler = Arc::new(MemoryScheduler::new());
        let handler = handler(
            vec![done("a", "1.1.0", 10)],
            Arc::new(MemoryStore::new()),
            scheduler.clone(),
        )
        .await;

        assert_eq!(handler.run_routine("missing").await, RunState::Unknown);
        assert!(!handler.run("missing").await);
        assert!(scheduler.pending().await.is_empty());
        assert!(handler.require("missing").is_err());
    }

    #[test_log::test(tokio::test)]
    async fn hooks_see_every_invocation() {
        let before = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        let handler = UpdateHandler::builder(UpgradeConfig::new("shop", "1.2.0"))
            .routine(done("a", "1.1.0", 10))
            .routine(
                UpgradeRoutine::new("b", || async { Ok(RoutineOutcome::Failed("later".into())) })
                    .version("1.1.0"),
            )
            .hooks(
                UpdateHooks::default()
                    .before_update({
                        let before = before.clone();
                        move |_| {
                            before.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                    .after_update({
                        let failed = failed.clone();
                        move |_, success| {
                            if !success {
                                failed.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    }),
            )
            .build(Arc::new(MemoryStore::new()), Arc::new(MemoryScheduler::new()))
            .await
            .unwrap();

        handler.run("a").await;
        handler.run("b").await;

        assert_eq!(before.load(Ordering::SeqCst), 2);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test)]
    async fn update_spaces_tasks_in_plan_order() {
        let scheduler = Arc::new(MemoryScheduler::new());
        let handler = handler(
            vec![
                done("c", "1.2.0", 10),
                done("b", "1.1.0", 20),
                done("a", "1.1.0", 10),
            ],
            Arc::new(MemoryStore::new()),
            scheduler.clone(),
        )
        .await;

        assert_eq!(handler.update(None).await.unwrap(), vec!["a", "b", "c"]);

        let pending = scheduler.pending().await;
        assert_eq!(
            pending
                .iter()
                .map(|action| action.payload.update_callback.as_str())
                .collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert_eq!(
            pending[2].run_at - pending[0].run_at,
            chrono::TimeDelta::seconds(2)
        );
        assert!(handler.has_scheduled().await.unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn marker_never_regresses_or_becomes_the_sentinel() {
        let store = Arc::new(MemoryStore::with_values([("shop_db_version", "1.5.0")]));
        let handler = handler(vec![], store.clone(), Arc::new(MemoryScheduler::new())).await;

        assert!(!handler.update_db_version(Some("1.2.0")).await.unwrap());
        assert!(!handler.update_db_version(Some("0.0.0")).await.unwrap());
        assert!(handler.update_db_version(Some("2.0.0")).await.unwrap());
        assert_eq!(
            store.get("shop_db_version").await.unwrap().as_deref(),
            Some("2.0.0")
        );
    }

    #[test_log::test(tokio::test)]
    async fn absent_marker_plans_from_the_sentinel() {
        let handler = handler(
            vec![done("a", "0.0.1", 10), done("b", "1.1.0", 10)],
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryScheduler::new()),
        )
        .await;

        let needed = handler.get_needed(None, false).await.unwrap();
        assert_eq!(
            needed.iter().map(|r| r.method_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert!(handler.needs_update(None).await.unwrap());
        assert!(!handler.needs_update(Some("1.1.0")).await.unwrap());
        assert!(handler.needs_update(Some("one")).await.is_err());
    }

    /// Fails the next write of one key, then behaves like a `MemoryStore`.
    struct FlakyStore {
        inner: MemoryStore,
        key: &'static str,
        fail_next: AtomicBool,
    }

    impl FlakyStore {
        fn failing_once(key: &'static str) -> Self {
            Self {
                inner: MemoryStore::new(),
                key,
                fail_next: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl OptionStore for FlakyStore {
        async fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> std::result::Result<(), StoreError> {
            if key == self.key && self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Backend("disk full".to_string()));
            }
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> std::result::Result<(), StoreError> {
            self.inner.delete(key).await
        }
    }

    #[test_log::test(tokio::test)]
    async fn failed_marker_write_is_retried_and_advances_later() {
        let store = Arc::new(FlakyStore::failing_once("shop_db_version"));
        let scheduler = Arc::new(MemoryScheduler::new());
        let sink = Arc::new(CollectingFaultSink::new());
        let handler = UpdateHandler::builder(UpgradeConfig::new("shop", "1.2.0"))
            .routine(done("a", "1.1.0", 10))
            .fault_sink(sink.clone())
            .build(store.clone(), scheduler.clone())
            .await
            .unwrap();

        assert!(!handler.run("a").await);

        let faults = sink.drain();
        assert_eq!(faults.len(), 1);
        assert!(faults[0].1.starts_with("Failed to advance version marker"));
        assert!(handler.ledger().contains("a").await);
        assert_eq!(handler.db_version().await.unwrap(), None);

        let pending = scheduler.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload.update_callback, "a");

        assert!(handler.run("a").await);
        assert_eq!(handler.ledger().completed().await, vec!["a"]);
        assert_eq!(
            handler.db_version().await.unwrap(),
            Some(Version::parse("1.1.0").unwrap())
        );
        assert!(sink.drain().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn failed_ledger_write_is_retried() {
        let store = Arc::new(FlakyStore::failing_once("completed_updates_shop"));
        let scheduler = Arc::new(MemoryScheduler::new());
        let handler = UpdateHandler::builder(UpgradeConfig::new("shop", "1.2.0"))
            .routine(done("a", "1.1.0", 10))
            .fault_sink(Arc::new(CollectingFaultSink::new()))
            .build(store, scheduler.clone())
            .await
            .unwrap();

        assert!(matches!(
            handler.run_routine("a").await,
            RunState::Failed(message) if message.starts_with("Failed to record completion")
        ));
        assert!(!handler.ledger().contains("a").await);
        assert_eq!(handler.db_version().await.unwrap(), None);
        assert_eq!(scheduler.pending().await.len(), 1);

        assert!(handler.run("a").await);
        assert!(handler.ledger().contains("a").await);
        assert_eq!(
            handler.db_version().await.unwrap(),
            Some(Version::parse("1.1.0").unwrap())
        );
    }

    #[test_log::test(tokio::test)]
    async fn panicking_hooks_are_contained() {
        let sink = Arc::new(CollectingFaultSink::new());
        let handler = UpdateHandler::builder(UpgradeConfig::new("shop", "1.2.0"))
            .routine(done("a", "1.1.0", 10))
            .hooks(UpdateHooks::default().before_update(|method_id| {
                assert_ne!(method_id, "a", "before hook rejected");
            }))
            .fault_sink(sink.clone())
            .build(Arc::new(MemoryStore::new()), Arc::new(MemoryScheduler::new()))
            .await
            .unwrap();

        assert!(!handler.run("a").await);
        assert!(!handler.is_updating());
        assert!(!handler.ledger().contains("a").await);

        let faults = sink.drain();
        assert_eq!(faults.len(), 1);
        assert!(faults[0].1.starts_with("before_update hook panicked"));

        let handler = UpdateHandler::builder(UpgradeConfig::new("shop", "1.2.0"))
            .routine(done("a", "1.1.0", 10))
            .hooks(UpdateHooks::default().after_update(|_, _| panic!("after hook")))
            .fault_sink(sink.clone())
            .build(Arc::new(MemoryStore::new()), Arc::new(MemoryScheduler::new()))
            .await
            .unwrap();

        assert!(handler.run("a").await);
        assert!(!handler.is_updating());
        assert!(handler.ledger().contains("a").await);
        assert!(sink.drain().is_empty());
    }

    #[test_log::test]
    fn offsets_clamp_instead_of_overflowing() {
        let now = Utc::now();

        assert_eq!(
            offset_from(now, TimeDelta::seconds(2), 3),
            now + TimeDelta::seconds(6)
        );
        assert_eq!(
            offset_from(now, TimeDelta::MAX, 1),
            DateTime::<Utc>::MAX_UTC
        );
        assert_eq!(
            offset_from(now, TimeDelta::days(365), i32::MAX),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[test_log::test(tokio::test)]
    async fn oversized_delays_are_rejected_at_build() {
        for config in [
            UpgradeConfig::new("shop", "1.2.0").with_retry_delay_secs(10_000_000_000_000),
            UpgradeConfig::new("shop", "1.2.0").with_schedule_spacing_secs(u64::MAX),
        ] {
            let result = UpdateHandler::builder(config)
                .routine(done("a", "1.1.0", 10))
                .build(Arc::new(MemoryStore::new()), Arc::new(MemoryScheduler::new()))
                .await;

            assert!(matches!(result, Err(UpgradeError::Config(_))));
        }
    }

    #[test_log::test(tokio::test)]
    async fn rejects_invalid_config() {
        let result = UpdateHandler::builder(UpgradeConfig::new("", "1.0.0"))
            .build(Arc::new(MemoryStore::new()), Arc::new(MemoryScheduler::new()))
            .await;

        assert!(matches!(result, Err(UpgradeError::Config(_))));
    }
}
