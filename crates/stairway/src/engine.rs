//! Engine façade
//!
//! `Stairway` is the single entry point: construct it against a journal,
//! register flight classes, `initialize` the backing storage, then
//! `recover_and_start` to reclaim any work left behind by a previous life of
//! this instance name and begin admitting new flights. `submit` enqueues new
//! work; `resume` re-admits a suspended flight; `quiet_down` stops admitting
//! new work and waits for in-flight flights to finish; `terminate`
//! additionally cancels them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::{ExceptionCodec, JsonExceptionCodec, JsonObjectCodec, ObjectCodec};
use crate::context::{FlightContext, FlightStatus, ParamMap};
use crate::hook::HookWrapper;
use crate::instance::{InMemoryInstanceRegistry, InstanceError, InstanceRegistry};
use crate::journal::{Journal, JournalError};
use crate::queue::{AdmitFn, QueueError, QueueTransport, WorkQueueManager};
use crate::registry::{FlightFactory, FlightRegistry};
use crate::runner::{FlightRunner, RunnerError};
use crate::step::FlightDebugInfo;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error("no flight class registered for {0}")]
    UnknownClass(String),

    #[error("flight id already exists: {0}")]
    DuplicateFlightId(String),

    #[error("flight not found: {0}")]
    NotFound(String),

    #[error("engine is quieting down, not accepting new work")]
    QuietingDown,
}

fn duration_millis_default() -> Duration {
    Duration::from_secs(3600)
}

/// Configuration for a [`Stairway`] instance. Mirrors the option table in
/// §6: parallelism bounds, identity, optional cluster queue, pluggable
/// codecs, and retention policy.
#[derive(Clone, Serialize, Deserialize)]
pub struct StairwayConfig {
    /// Upper bound on concurrently running flights for this instance.
    pub max_parallel_flights: usize,
    /// Threshold past which `submit` deflects new work to the cluster queue
    /// instead of this instance's local runnable queue, rather than a hard
    /// cap on the local queue's length.
    pub max_queued_flights: usize,
    /// This engine instance's name, recorded in the instance registry and
    /// used as the journal `owner` for every flight it claims.
    pub instance_name: String,
    /// How long a completed flight is retained before the retention sweep
    /// deletes it. `None` retains completed flights forever.
    #[serde(skip, default)]
    pub completed_flight_retention: Option<Duration>,
    /// How often the retention sweep runs, when retention is configured.
    #[serde(skip, default = "duration_millis_default")]
    pub retention_check_interval: Duration,
    /// Age past which an unowned resumable flight is treated as recoverable
    /// by the periodic recovery scan, not just at `recover_and_start`.
    #[serde(skip, default = "duration_millis_default")]
    pub recovery_scan_interval: Duration,
}

impl Default for StairwayConfig {
    fn default() -> Self {
        Self {
            max_parallel_flights: 20,
            max_queued_flights: 2,
            instance_name: format!("stairway-{}", uuid::Uuid::new_v4()),
            completed_flight_retention: None,
            retention_check_interval: Duration::from_secs(3600),
            recovery_scan_interval: Duration::from_secs(60),
        }
    }
}

impl StairwayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_parallel_flights(mut self, n: usize) -> Self {
        self.max_parallel_flights = n.max(1);
        self
    }

    pub fn with_max_queued_flights(mut self, n: usize) -> Self {
        self.max_queued_flights = n;
        self
    }

    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = name.into();
        self
    }

    pub fn with_completed_flight_retention(mut self, retention: Duration) -> Self {
        self.completed_flight_retention = Some(retention);
        self
    }

    pub fn with_retention_check_interval(mut self, interval: Duration) -> Self {
        self.retention_check_interval = interval;
        self
    }

    pub fn with_recovery_scan_interval(mut self, interval: Duration) -> Self {
        self.recovery_scan_interval = interval;
        self
    }
}

/// Work admitted locally but not yet claimed: the "linked unbounded runnable
/// queue" of §4.8, realized as a plain `VecDeque` behind a lock — unbounded
/// because the original queue is unbounded.
struct LocalQueue {
    pending: Mutex<VecDeque<(String, String)>>,
}

impl LocalQueue {
    fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, flight_id: impl Into<String>, class_name: impl Into<String>) {
        self.pending.lock().push_back((flight_id.into(), class_name.into()));
    }

    fn pop(&self) -> Option<(String, String)> {
        self.pending.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

struct Inner {
    journal: Arc<dyn Journal>,
    instances: Arc<dyn InstanceRegistry>,
    flights: Arc<FlightRegistry>,
    hooks: Arc<HookWrapper>,
    exception_codec: Arc<dyn ExceptionCodec>,
    object_codec: Arc<dyn ObjectCodec>,
    queue: Option<Arc<WorkQueueManager>>,
    config: StairwayConfig,
    semaphore: Arc<Semaphore>,
    local_queue: Arc<LocalQueue>,
    active_count: Arc<AtomicUsize>,
    quieting: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    running_flights: Mutex<HashMap<String, CancellationToken>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// The engine façade. Cheap to clone: internally an `Arc`.
#[derive(Clone)]
pub struct Stairway(Arc<Inner>);

impl Stairway {
    /// Construct against a journal, using in-memory defaults for the
    /// instance registry, codecs, and hooks. Use the `with_*` builders
    /// before `initialize` to override any of these.
    pub fn new(journal: Arc<dyn Journal>, config: StairwayConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self(Arc::new(Inner {
            journal,
            instances: Arc::new(InMemoryInstanceRegistry::new()),
            flights: Arc::new(FlightRegistry::new()),
            hooks: Arc::new(HookWrapper::new()),
            exception_codec: Arc::new(JsonExceptionCodec),
            object_codec: Arc::new(JsonObjectCodec),
            queue: None,
            semaphore: Arc::new(Semaphore::new(config.max_parallel_flights)),
            local_queue: Arc::new(LocalQueue::new()),
            active_count: Arc::new(AtomicUsize::new(0)),
            quieting: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            running_flights: Mutex::new(HashMap::new()),
            background: Mutex::new(Vec::new()),
            config,
        }))
    }

    /// Swap in a different instance registry, e.g. `PostgresInstanceRegistry`.
    /// Only meaningful before `initialize`.
    pub fn with_instance_registry(self, instances: Arc<dyn InstanceRegistry>) -> Self {
        let mut inner = match Arc::try_unwrap(self.0) {
            Ok(inner) => inner,
            Err(shared) => return Self(shared),
        };
        inner.instances = instances;
        Self(Arc::new(inner))
    }

    pub fn with_hooks(self, hooks: HookWrapper) -> Self {
        let mut inner = match Arc::try_unwrap(self.0) {
            Ok(inner) => inner,
            Err(shared) => return Self(shared),
        };
        inner.hooks = Arc::new(hooks);
        Self(Arc::new(inner))
    }

    pub fn with_queue(self, transport: Arc<dyn QueueTransport>) -> Self {
        let mut inner = match Arc::try_unwrap(self.0) {
            Ok(inner) => inner,
            Err(shared) => return Self(shared),
        };
        inner.queue = Some(Arc::new(WorkQueueManager::new(transport)));
        Self(Arc::new(inner))
    }

    pub fn with_exception_codec(self, codec: Arc<dyn ExceptionCodec>) -> Self {
        let mut inner = match Arc::try_unwrap(self.0) {
            Ok(inner) => inner,
            Err(shared) => return Self(shared),
        };
        inner.exception_codec = codec;
        Self(Arc::new(inner))
    }

    pub fn with_object_codec(self, codec: Arc<dyn ObjectCodec>) -> Self {
        let mut inner = match Arc::try_unwrap(self.0) {
            Ok(inner) => inner,
            Err(shared) => return Self(shared),
        };
        inner.object_codec = codec;
        Self(Arc::new(inner))
    }

    /// Register the factory used to build `class_name`'s steps and retry
    /// rules, both at submission time and during recovery.
    pub fn register_flight(&self, class_name: impl Into<String>, factory: FlightFactory) {
        self.0.flights.register(class_name, factory);
    }

    pub fn object_codec(&self) -> &Arc<dyn ObjectCodec> {
        &self.0.object_codec
    }

    pub fn instance_name(&self) -> &str {
        &self.0.config.instance_name
    }

    /// Prepare storage. `force_clean` drops and recreates the journal schema
    /// and purges the cluster queue, for test setup and the rare deliberate
    /// wipe; otherwise this is the idempotent `CREATE TABLE IF NOT EXISTS`
    /// path safe to call on every startup.
    #[instrument(skip(self))]
    pub async fn initialize(&self, force_clean: bool) -> Result<Vec<String>, EngineError> {
        if force_clean {
            self.0.journal.reset().await?;
            if let Some(queue) = &self.0.queue {
                queue.purge().await?;
            }
        } else {
            self.0.journal.initialize().await?;
        }
        self.0.instances.initialize().await?;
        Ok(self.0.instances.list().await?)
    }

    /// Register this instance, reclaim any flights left `RUNNING` under this
    /// same instance name by a previous, crashed life of this process, reclaim
    /// flights left behind by each name in `obsolete_instance_names` (and
    /// forget those names), admit every unowned `READY`/`READY_TO_RESTART`
    /// flight, and start the background dispatcher (and cluster queue
    /// listener, if configured).
    #[instrument(skip(self))]
    pub async fn recover_and_start(&self, obsolete_instance_names: &[String]) -> Result<(), EngineError> {
        self.0.instances.find_or_create(&self.0.config.instance_name).await?;

        let mut reclaimed = self.0.journal.disown_recovery(&self.0.config.instance_name).await?;
        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "reclaimed flights from a previous life of this instance");
        }

        for obsolete in obsolete_instance_names {
            let more = self.0.journal.disown_recovery(obsolete).await?;
            if !more.is_empty() {
                info!(count = more.len(), instance = %obsolete, "reclaimed flights from an obsolete instance");
            }
            reclaimed.extend(more);
            self.0.instances.delete(obsolete).await?;
        }

        let ready = self.0.journal.get_ready_flights().await?;
        for flight_id in reclaimed.into_iter().chain(ready) {
            if let Some(row) = self.0.journal.load(&flight_id).await? {
                self.0.local_queue.push(row.flight_id, row.class_name);
            }
        }

        self.spawn_dispatcher();
        if self.0.queue.is_some() {
            self.spawn_queue_listener();
        }
        if self.0.config.completed_flight_retention.is_some() {
            self.spawn_retention_sweep();
        }

        Ok(())
    }

    /// Submit a new flight of `class_name`. Returns the generated flight id.
    /// `should_queue` forces deflection to the cluster queue (when one is
    /// configured) even if this instance has a free runner slot right now —
    /// the caller's hint, not just the local-capacity check, decides.
    #[instrument(skip(self, input, debug_info), fields(class_name = %class_name.as_ref()))]
    pub async fn submit(
        &self,
        class_name: impl AsRef<str>,
        input: BTreeMap<String, String>,
        should_queue: bool,
        debug_info: FlightDebugInfo,
    ) -> Result<String, EngineError> {
        let class_name = class_name.as_ref();
        if !self.0.flights.list().iter().any(|c| c == class_name) {
            return Err(EngineError::UnknownClass(class_name.to_string()));
        }
        if self.0.quieting.load(Ordering::SeqCst) {
            return Err(EngineError::QuietingDown);
        }

        let flight_id = uuid::Uuid::new_v4().to_string();
        let row = self
            .0
            .journal
            .create_flight(&flight_id, class_name, &self.0.config.instance_name, input, debug_info)
            .await
            .map_err(|err| match err {
                JournalError::AlreadyExists(id) => EngineError::DuplicateFlightId(id),
                other => EngineError::Journal(other),
            })?;

        match Arc::clone(&self.0.semaphore).try_acquire_owned() {
            Ok(permit) if !should_queue => self.spawn_runner(row, permit),
            _ => self.deflect(row.flight_id, row.class_name, should_queue).await?,
        }

        Ok(flight_id)
    }

    /// Re-admit a suspended (`WAITING`/`READY`/`QUEUED`/`READY_TO_RESTART`)
    /// flight, claiming ownership immediately rather than going through the
    /// local queue.
    #[instrument(skip(self))]
    pub async fn resume(&self, flight_id: &str) -> Result<(), EngineError> {
        if self.0.quieting.load(Ordering::SeqCst) {
            return Err(EngineError::QuietingDown);
        }
        let row = self.0.journal.claim_owner(flight_id, &self.0.config.instance_name).await?;
        let permit = Arc::clone(&self.0.semaphore)
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        self.spawn_runner(row, permit);
        Ok(())
    }

    /// Stop admitting new work and signal the dispatcher/listener loops to
    /// exit once their current iteration completes. Does not wait for
    /// in-flight flights; call [`Stairway::wait_for_quiesce`] for that.
    pub fn quiet_down(&self) {
        self.0.quieting.store(true, Ordering::SeqCst);
        let _ = self.0.shutdown_tx.send(true);
    }

    /// Block until every in-flight flight has released ownership, or
    /// `deadline` elapses.
    pub async fn wait_for_quiesce(&self, deadline: Duration) -> bool {
        let start = tokio::time::Instant::now();
        loop {
            if self.0.active_count.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if start.elapsed() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// `quiet_down` plus cancellation of every currently running flight's
    /// task, for an immediate (not graceful) stop.
    pub fn terminate(&self) {
        self.quiet_down();
        for (_, token) in self.0.running_flights.lock().drain() {
            token.cancel();
        }
        for handle in self.0.background.lock().drain(..) {
            handle.abort();
        }
    }

    pub fn active_flight_count(&self) -> usize {
        self.0.active_count.load(Ordering::SeqCst)
    }

    /// Try to admit a flight locally; if this instance's local queue is
    /// already past `max_queued_flights`, deflect to the cluster queue
    /// instead (falling back to the local queue if no cluster queue is
    /// configured — the admission predicate is advisory, never a hard cap).
    async fn deflect(&self, flight_id: String, class_name: String, should_queue: bool) -> Result<(), EngineError> {
        self.0
            .journal
            .release_owner(
                &flight_id,
                &self.0.config.instance_name,
                crate::journal::FlightState {
                    status: FlightStatus::Ready,
                    direction: crate::context::Direction::Start,
                    step_index: 0,
                },
                None,
            )
            .await?;

        let over_local_threshold = self.0.local_queue.len() >= self.0.config.max_queued_flights;
        match (&self.0.queue, should_queue || over_local_threshold) {
            (Some(queue), true) => {
                // Enqueue before marking QUEUED: a crash between the two
                // leaves the row READY, so recovery still finds and
                // requeues it. Marking QUEUED first would let a crash after
                // the mark but before the publish strand the flight.
                queue.enqueue_ready(flight_id.clone(), class_name).await?;
                self.0.journal.mark_queued(&flight_id).await?;
            }
            _ => self.0.local_queue.push(flight_id, class_name),
        }
        Ok(())
    }

    fn spawn_runner(&self, row: crate::journal::FlightRow, permit: tokio::sync::OwnedSemaphorePermit) {
        let inner = self.0.clone();
        let (steps, retry_rules) = match inner.flights.build(&row.class_name) {
            Some(pair) => pair,
            None => {
                error!(class_name = %row.class_name, "no factory registered; disowning flight");
                let flight_id = row.flight_id.clone();
                tokio::spawn(async move {
                    let _ = inner
                        .journal
                        .release_owner(
                            &flight_id,
                            &inner.config.instance_name,
                            crate::journal::FlightState {
                                status: FlightStatus::Ready,
                                direction: crate::context::Direction::Start,
                                step_index: 0,
                            },
                            Some(format!("no factory registered for class {}", flight_id)),
                        )
                        .await;
                });
                return;
            }
        };

        let cancellation = CancellationToken::new();
        inner.running_flights.lock().insert(row.flight_id.clone(), cancellation.clone());
        inner.active_count.fetch_add(1, Ordering::SeqCst);

        let flight_id = row.flight_id.clone();
        let class_name = row.class_name.clone();
        let inner_for_task = inner.clone();
        tokio::spawn(async move {
            let _permit = permit;

            // The working map isn't part of `FlightRow`: reconstruct it from
            // the log entry with the highest sequence for this flight (§4.1),
            // since that is the last snapshot a runner on any instance wrote.
            let working = match inner_for_task.journal.load_log(&row.flight_id).await {
                Ok(log) => log.last().map(|entry| entry.working.clone()).unwrap_or_default(),
                Err(err) => {
                    error!(flight_id = %flight_id, error = %err, "failed to load log for working-map restoration");
                    BTreeMap::new()
                }
            };

            let mut ctx = FlightContext::new(
                row.flight_id.clone(),
                row.class_name.clone(),
                ParamMap::sealed(row.input.clone()),
                steps.len(),
                row.debug_info.clone(),
            );
            ctx.persisted = ParamMap::restored(row.persisted.clone());
            ctx.working = ParamMap::restored(working);
            ctx.direction = row.state.direction;
            ctx.step_index = row.state.step_index;
            ctx.status = row.state.status;

            let runner_result = FlightRunner::new(
                ctx,
                inner_for_task.config.instance_name.clone(),
                inner_for_task.journal.clone(),
                inner_for_task.hooks.clone(),
                inner_for_task.exception_codec.clone(),
                steps,
                retry_rules,
                cancellation,
                inner_for_task.quieting.clone(),
            );

            match runner_result {
                Ok(mut runner) => match runner.run().await {
                    Ok(status) => {
                        debug!(flight_id = %flight_id, ?status, "flight run complete");
                        if matches!(status, FlightStatus::Ready | FlightStatus::ReadyToRestart) {
                            inner_for_task.local_queue.push(flight_id.clone(), class_name);
                        }
                    }
                    Err(err) => {
                        error!(flight_id = %flight_id, error = %err, "flight run failed");
                    }
                },
                Err(err) => {
                    error!(flight_id = %flight_id, error = %err, "failed to construct flight runner");
                }
            }
            inner_for_task.running_flights.lock().remove(&flight_id);
            inner_for_task.active_count.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Pulls locally-admitted work and spawns a runner for each, respecting
    /// the semaphore: claims from the local queue, falling back to an
    /// empty-queue sleep when nothing is pending.
    fn spawn_dispatcher(&self) {
        let inner = self.0.clone();
        let this = self.clone();
        let mut shutdown_rx = inner.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    return;
                }
                let Some((flight_id, _class_name)) = inner.local_queue.pop() else {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                    continue;
                };

                let permit = tokio::select! {
                    permit = Arc::clone(&inner.semaphore).acquire_owned() => permit.expect("semaphore is never closed"),
                    _ = shutdown_rx.changed() => {
                        inner.local_queue.push(flight_id, _class_name);
                        continue;
                    }
                };

                match inner.journal.claim_owner(&flight_id, &inner.config.instance_name).await {
                    Ok(row) => this.spawn_runner(row, permit),
                    Err(JournalError::OwnershipConflict { .. }) | Err(JournalError::NotFound(_)) => {
                        drop(permit);
                    }
                    Err(err) => {
                        warn!(flight_id = %flight_id, error = %err, "claim_owner failed in dispatcher");
                        drop(permit);
                    }
                }
            }
        });
        inner.background.lock().push(handle);
    }

    fn spawn_queue_listener(&self) {
        let inner = self.0.clone();
        let this = self.clone();
        let queue = inner.queue.clone().expect("checked by caller");
        let cancellation = CancellationToken::new();
        let mut shutdown_rx = inner.shutdown_rx.clone();
        let cancellation_for_watch = cancellation.clone();
        let watch_handle = tokio::spawn(async move {
            let _ = shutdown_rx.changed().await;
            cancellation_for_watch.cancel();
        });

        let admit: AdmitFn = {
            let this = this.clone();
            Arc::new(move |flight_id: String, _class_name: String| -> BoxFuture<'static, bool> {
                let this = this.clone();
                Box::pin(async move { this.try_claim_and_run(&flight_id).await })
            })
        };

        let has_capacity: crate::queue::CapacityFn = {
            let inner = inner.clone();
            Arc::new(move || {
                inner.semaphore.available_permits() > 0
                    || inner.local_queue.len() < inner.config.max_queued_flights
            })
        };

        let handle = tokio::spawn(async move {
            queue.run_listener(cancellation, admit, has_capacity).await;
        });
        inner.background.lock().push(handle);
        inner.background.lock().push(watch_handle);
    }

    /// Claim `flight_id` if a runner slot is free right now, spawning it;
    /// declines (returns `false`) without claiming if the pool is saturated,
    /// leaving the flight for the next recovery scan or listener.
    async fn try_claim_and_run(&self, flight_id: &str) -> bool {
        let Ok(permit) = Arc::clone(&self.0.semaphore).try_acquire_owned() else {
            return false;
        };
        match self.0.journal.claim_owner(flight_id, &self.0.config.instance_name).await {
            Ok(row) => {
                self.spawn_runner(row, permit);
                true
            }
            Err(_) => false,
        }
    }

    fn spawn_retention_sweep(&self) {
        let inner = self.0.clone();
        let retention = inner
            .config
            .completed_flight_retention
            .expect("checked by caller");
        let interval = inner.config.retention_check_interval;
        let mut shutdown_rx = inner.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => return,
                }
                let older_than = chrono::Utc::now() - chrono::Duration::from_std(retention).unwrap_or_default();
                match inner.journal.delete_completed_before(older_than).await {
                    Ok(count) if count > 0 => info!(count, "retention sweep deleted completed flights"),
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "retention sweep failed"),
                }
            }
        });
        inner.background.lock().push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::InMemoryJournal;
    use crate::retry::NoRetry;
    use crate::step::{Step, StepResult};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration as StdDuration;

    struct AlwaysSucceeds;

    #[async_trait]
    impl Step for AlwaysSucceeds {
        async fn do_(&self, _ctx: &mut FlightContext) -> StepResult {
            StepResult::success()
        }
    }

    struct AlwaysFatal;

    #[async_trait]
    impl Step for AlwaysFatal {
        async fn do_(&self, _ctx: &mut FlightContext) -> StepResult {
            StepResult::failure_fatal("boom")
        }
    }

    fn simple_factory() -> FlightFactory {
        Arc::new(|| vec![(Arc::new(AlwaysSucceeds) as Arc<dyn Step>, Box::new(NoRetry) as Box<_>)])
    }

    fn fatal_factory() -> FlightFactory {
        Arc::new(|| vec![(Arc::new(AlwaysFatal) as Arc<dyn Step>, Box::new(NoRetry) as Box<_>)])
    }

    async fn wait_until(engine: &Stairway, target: crate::context::FlightStatus, flight_id: &str, journal: &InMemoryJournal) -> bool {
        for _ in 0..200 {
            if let Some(row) = journal.load(flight_id).await.unwrap() {
                if row.state.status == target {
                    return true;
                }
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        let _ = engine;
        false
    }

    #[tokio::test]
    async fn submit_runs_flight_to_success() {
        let journal = Arc::new(InMemoryJournal::new());
        let engine = Stairway::new(journal.clone(), StairwayConfig::new());
        engine.register_flight("Order", simple_factory());
        engine.initialize(true).await.unwrap();
        engine.recover_and_start(&[]).await.unwrap();

        let flight_id = engine.submit("Order", BTreeMap::new(), false, FlightDebugInfo::default()).await.unwrap();
        assert!(wait_until(&engine, FlightStatus::Success, &flight_id, &journal).await);
    }

    #[tokio::test]
    async fn submit_unknown_class_is_rejected() {
        let journal = Arc::new(InMemoryJournal::new());
        let engine = Stairway::new(journal, StairwayConfig::new());
        engine.initialize(true).await.unwrap();
        engine.recover_and_start(&[]).await.unwrap();

        let result = engine.submit("Missing", BTreeMap::new(), false, FlightDebugInfo::default()).await;
        assert!(matches!(result, Err(EngineError::UnknownClass(_))));
    }

    #[tokio::test]
    async fn quiet_down_rejects_new_submissions() {
        let journal = Arc::new(InMemoryJournal::new());
        let engine = Stairway::new(journal, StairwayConfig::new());
        engine.register_flight("Order", simple_factory());
        engine.initialize(true).await.unwrap();
        engine.recover_and_start(&[]).await.unwrap();

        engine.quiet_down();
        let result = engine.submit("Order", BTreeMap::new(), false, FlightDebugInfo::default()).await;
        assert!(matches!(result, Err(EngineError::QuietingDown)));
    }

    #[tokio::test]
    async fn recover_and_start_reclaims_flights_owned_by_same_instance() {
        let journal = Arc::new(InMemoryJournal::new());
        journal
            .create_flight("f1", "Order", "restarted-instance", BTreeMap::new(), FlightDebugInfo::default())
            .await
            .unwrap();

        let config = StairwayConfig::new().with_instance_name("restarted-instance");
        let engine = Stairway::new(journal.clone(), config);
        engine.register_flight("Order", simple_factory());
        engine.initialize(false).await.unwrap();
        engine.recover_and_start(&[]).await.unwrap();

        assert!(wait_until(&engine, FlightStatus::Success, "f1", &journal).await);
    }

    #[tokio::test]
    async fn fatal_flight_reaches_error_status() {
        let journal = Arc::new(InMemoryJournal::new());
        let engine = Stairway::new(journal.clone(), StairwayConfig::new());
        engine.register_flight("Doomed", fatal_factory());
        engine.initialize(true).await.unwrap();
        engine.recover_and_start(&[]).await.unwrap();

        let flight_id = engine.submit("Doomed", BTreeMap::new(), false, FlightDebugInfo::default()).await.unwrap();
        assert!(wait_until(&engine, FlightStatus::Error, &flight_id, &journal).await);
    }

    #[tokio::test]
    async fn resume_reclaims_a_waiting_flight() {
        let journal = Arc::new(InMemoryJournal::new());
        let engine = Stairway::new(journal.clone(), StairwayConfig::new());
        engine.register_flight("Order", simple_factory());
        engine.initialize(true).await.unwrap();
        engine.recover_and_start(&[]).await.unwrap();

        journal
            .create_flight("f1", "Order", &engine.instance_name().to_string(), BTreeMap::new(), FlightDebugInfo::default())
            .await
            .unwrap();
        journal
            .release_owner(
                "f1",
                engine.instance_name(),
                crate::journal::FlightState {
                    status: FlightStatus::Waiting,
                    direction: crate::context::Direction::Do,
                    step_index: 0,
                },
                None,
            )
            .await
            .unwrap();

        engine.resume("f1").await.unwrap();
        assert!(wait_until(&engine, FlightStatus::Success, "f1", &journal).await);
    }
}
