use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime},
};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    connection::ConnectionManager,
    driver::{ConnectionInfo, DriverError, SqlConnection, SqlDriver},
    normalizer::{self, CommandKind},
    record::CommandRecord,
    scheduler::{DelayScheduler, WaitOutcome},
    trace_event::{self, TraceEventKind},
};

const DISPOSE_STEP_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_THROUGHPUT_SAMPLES: usize = 60;

/// Per-worker policy, derived from the `[replay]` config section.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub query_timeout: Duration,
    pub fail_retry_max: u32,
    pub timeout_retry_max: u32,
    pub stop_on_error: bool,
    pub mimic_app_name: bool,
    pub consume_results: bool,
    pub raise_errors_to_tracing: bool,
    pub display_worker_stats: bool,
    pub worker_stats_command_count: u64,
    pub database_map: BTreeMap<String, String>,
    pub timeout_error_codes: Vec<i32>,
    pub command_error_log_level: tracing::Level,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        let config = crate::config::ReplayConfig::default();
        Self {
            query_timeout: Duration::from_secs(config.query_timeout_s),
            fail_retry_max: config.fail_retry_max,
            timeout_retry_max: config.timeout_retry_max,
            stop_on_error: config.stop_on_error,
            mimic_app_name: config.mimic_application_name,
            consume_results: config.consume_results,
            raise_errors_to_tracing: config.raise_errors_to_tracing,
            display_worker_stats: config.display_worker_stats,
            worker_stats_command_count: config.worker_stats_command_count,
            database_map: config.database_map,
            timeout_error_codes: config.timeout_error_codes,
            command_error_log_level: tracing::Level::ERROR,
        }
    }
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        let replay = &config.replay;
        Self {
            query_timeout: Duration::from_secs(replay.query_timeout_s),
            fail_retry_max: replay.fail_retry_max,
            timeout_retry_max: replay.timeout_retry_max,
            stop_on_error: replay.stop_on_error,
            mimic_app_name: replay.mimic_application_name,
            consume_results: replay.consume_results,
            raise_errors_to_tracing: replay.raise_errors_to_tracing,
            display_worker_stats: replay.display_worker_stats,
            worker_stats_command_count: replay.worker_stats_command_count,
            database_map: replay.database_map.clone(),
            timeout_error_codes: replay.timeout_error_codes.clone(),
            command_error_log_level: replay
                .command_error_level()
                .unwrap_or(tracing::Level::ERROR),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Timeout,
    DbError,
    Other,
}

/// Splits driver failures into the three classes the retrier distinguishes.
pub fn classify_failure(err: &DriverError, timeout_codes: &[i32]) -> FailureClass {
    match err.code() {
        Some(code) if timeout_codes.contains(&code) => FailureClass::Timeout,
        Some(_) => FailureClass::DbError,
        None => FailureClass::Other,
    }
}

enum Execution {
    Completed,
    Skipped,
}

/// State touched only by the worker's own task (and its retries). The coarse
/// lock also keeps external `dispose` from racing an in-flight command.
struct WorkerState {
    connection: ConnectionManager,
    prepared: HashMap<i64, i64>,
    anchor: Option<Instant>,
    scheduler: DelayScheduler,
    stats: ThroughputStats,
}

/// Replays the commands of a single captured session on its own connection.
///
/// Producers `append` commands and call `start`; the background task drains
/// the queue in enqueue order and self-parks when it runs dry, leaving the
/// dispatcher's next enqueue to restart it. `stop` is the single cancellation
/// primitive and is idempotent.
pub struct ReplayWorker {
    name: String,
    driver: Arc<dyn SqlDriver>,
    info: ConnectionInfo,
    settings: WorkerSettings,
    queue: Mutex<VecDeque<CommandRecord>>,
    running: AtomicBool,
    stopped: AtomicBool,
    disposed: AtomicBool,
    cancel: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    state: tokio::sync::Mutex<WorkerState>,
    executed_count: AtomicU64,
    consecutive_skipped_delays: AtomicU32,
    last_activity: Mutex<Instant>,
    last_command_time: Mutex<Option<SystemTime>>,
}

impl ReplayWorker {
    pub fn new(
        name: impl Into<String>,
        driver: Arc<dyn SqlDriver>,
        info: ConnectionInfo,
        settings: WorkerSettings,
    ) -> Arc<Self> {
        let name = name.into();
        let connection = ConnectionManager::new(
            Arc::clone(&driver),
            info.clone(),
            settings.mimic_app_name,
            settings.database_map.clone(),
        );
        Arc::new(Self {
            state: tokio::sync::Mutex::new(WorkerState {
                connection,
                prepared: HashMap::new(),
                anchor: None,
                scheduler: DelayScheduler::new(name.clone()),
                stats: ThroughputStats::new(),
            }),
            name,
            driver,
            info,
            settings,
            queue: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            executed_count: AtomicU64::new(0),
            consecutive_skipped_delays: AtomicU32::new(0),
            last_activity: Mutex::new(Instant::now()),
            last_command_time: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("queue lock poisoned").len()
    }

    pub fn executed_count(&self) -> u64 {
        self.executed_count.load(Ordering::Acquire)
    }

    pub fn consecutive_skipped_delays(&self) -> u32 {
        self.consecutive_skipped_delays.load(Ordering::Acquire)
    }

    pub fn last_command_time(&self) -> Option<SystemTime> {
        *self.last_command_time.lock().expect("time lock poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// True when the worker has no queued work and its task has parked.
    pub fn is_idle(&self) -> bool {
        !self.is_running() && self.queue_len() == 0
    }

    /// Time since the last enqueue or executed command.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("activity lock poisoned")
            .elapsed()
    }

    /// Places a command at the queue tail. Safe to call concurrently with the
    /// running loop; commands appended after `stop` are dropped.
    pub fn append(&self, cmd: CommandRecord) {
        if self.is_stopped() {
            tracing::debug!(worker = %self.name, "dropping command appended after stop");
            return;
        }
        self.queue
            .lock()
            .expect("queue lock poisoned")
            .push_back(cmd);
        self.touch();
    }

    /// Ensures exactly one background task is draining the queue. Idempotent,
    /// and race-free against the task's own self-park.
    pub fn start(self: &Arc<Self>) {
        if self.is_stopped() {
            return;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let worker = Arc::clone(self);
            let handle = tokio::spawn(worker.run());
            *self.task.lock().expect("task lock poisoned") = Some(handle);
        }
    }

    /// Signals cancellation; the loop and any in-progress wait exit at their
    /// next check. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
    }

    /// Stops the worker and releases everything it owns: the connection, the
    /// background task, and the cancellation handle. Each step is attempted
    /// even if an earlier one fails; the call is idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();

        match tokio::time::timeout(DISPOSE_STEP_TIMEOUT, self.state.lock()).await {
            Ok(mut state) => state.connection.close().await,
            Err(_) => {
                tracing::warn!(worker = %self.name, "timed out waiting to release the connection")
            }
        }

        let task = self.task.lock().expect("task lock poisoned").take();
        if let Some(task) = task {
            if tokio::time::timeout(DISPOSE_STEP_TIMEOUT, task).await.is_err() {
                tracing::warn!(worker = %self.name, "background task did not finish in time");
            }
        }
        // The cancellation handle goes with the worker itself; nothing else
        // holds it once the task is gone.
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.is_stopped() {
                break;
            }
            let next = self.queue.lock().expect("queue lock poisoned").pop_front();
            match next {
                Some(cmd) => {
                    if let Err(err) = self.execute(cmd).await {
                        tracing::error!(
                            worker = %self.name,
                            "stopping worker after execution failure: {err}"
                        );
                        self.stop();
                        break;
                    }
                }
                None => {
                    self.running.store(false, Ordering::Release);
                    // An enqueue may have landed between the empty pop and the
                    // park. If so and no restart has claimed the slot yet,
                    // reclaim it and keep draining.
                    let has_work = !self.queue.lock().expect("queue lock poisoned").is_empty();
                    if has_work
                        && self
                            .running
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                    {
                        continue;
                    }
                    return;
                }
            }
        }
        self.running.store(false, Ordering::Release);
    }

    /// Executes one command, including its delay, retries, and failure
    /// handling. Returns `Err` only when `stop_on_error` demands the loop
    /// unwind.
    async fn execute(&self, cmd: CommandRecord) -> Result<(), DriverError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.anchor.is_none() {
            state.anchor = Some(Instant::now());
        }
        let anchor = state.anchor.expect("anchor just set");

        let mut timeout_retries = 0u32;
        let mut fail_retries = 0u32;

        loop {
            // Every attempt re-runs the full dispatch, delay first; a retry
            // sees a negative delay and proceeds immediately.
            let outcome = state
                .scheduler
                .wait_for_offset(cmd.replay_offset_ms, anchor, &self.cancel)
                .await;
            self.consecutive_skipped_delays
                .store(state.scheduler.consecutive_skipped(), Ordering::Release);
            if outcome == WaitOutcome::Cancelled || self.is_stopped() {
                return Ok(());
            }

            let result = self.execute_once(state, &cmd).await;
            *self.last_command_time.lock().expect("time lock poisoned") =
                Some(SystemTime::now());
            self.touch();

            let err = match result {
                Ok(Execution::Completed) => {
                    let executed = self.executed_count.fetch_add(1, Ordering::AcqRel) + 1;
                    if self.settings.display_worker_stats {
                        state.stats.record(
                            &self.name,
                            self.settings.worker_stats_command_count,
                            executed,
                            self.queue_len(),
                            cmd.event_sequence,
                        );
                    }
                    return Ok(());
                }
                Ok(Execution::Skipped) => return Ok(()),
                Err(err) => err,
            };

            self.log_command_error(&cmd, &err);
            match classify_failure(&err, &self.settings.timeout_error_codes) {
                FailureClass::Timeout => {
                    if self.settings.raise_errors_to_tracing {
                        self.raise_trace_event(TraceEventKind::Timeout, &cmd, &err).await;
                    }
                    if self.settings.stop_on_error {
                        state.connection.clear_pool().await;
                        return Err(err);
                    }
                    if timeout_retries < self.settings.timeout_retry_max {
                        timeout_retries += 1;
                        continue;
                    }
                    return Ok(());
                }
                FailureClass::DbError => {
                    if self.settings.raise_errors_to_tracing {
                        self.raise_trace_event(TraceEventKind::Error, &cmd, &err).await;
                    }
                    if self.settings.stop_on_error {
                        state.connection.clear_pool().await;
                        return Err(err);
                    }
                    if fail_retries < self.settings.fail_retry_max {
                        fail_retries += 1;
                        continue;
                    }
                    return Ok(());
                }
                FailureClass::Other => {
                    state.connection.clear_pool().await;
                    if self.settings.stop_on_error {
                        return Err(err);
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn execute_once(
        &self,
        state: &mut WorkerState,
        cmd: &CommandRecord,
    ) -> Result<Execution, DriverError> {
        let normalized = normalizer::normalize(&cmd.text);

        match normalized.kind {
            CommandKind::ResetConn => {
                match state
                    .connection
                    .reset(&cmd.app_name, &cmd.database, &self.cancel)
                    .await
                {
                    Ok(()) => Ok(Execution::Completed),
                    Err(err) => {
                        tracing::warn!(
                            worker = %self.name,
                            "connection reset could not re-open: {err}"
                        );
                        Ok(Execution::Skipped)
                    }
                }
            }
            CommandKind::ResetConnNonpooled => {
                state.connection.clear_pool().await;
                Ok(Execution::Completed)
            }
            _ => {
                let conn = match state
                    .connection
                    .acquire(&cmd.app_name, &cmd.database, &self.cancel)
                    .await
                {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(
                            worker = %self.name,
                            session = cmd.session_id,
                            "unable to acquire connection: {err}"
                        );
                        return Ok(Execution::Skipped);
                    }
                };

                match normalized.kind {
                    CommandKind::Prepare => {
                        let server = conn
                            .execute_scalar_int(
                                &normalized.normalized_text,
                                self.settings.query_timeout,
                            )
                            .await?;
                        if let (Some(source), Some(server)) =
                            (normalized.source_handle_id, server)
                        {
                            // A source handle prepared twice keeps its first
                            // server handle.
                            state.prepared.entry(source).or_insert(server);
                        }
                        Ok(Execution::Completed)
                    }
                    CommandKind::Execute => {
                        let Some(source) = normalized.source_handle_id else {
                            return Ok(Execution::Skipped);
                        };
                        let Some(&server) = state.prepared.get(&source) else {
                            // The prepare predates the replay window.
                            return Ok(Execution::Skipped);
                        };
                        let sql =
                            normalizer::substitute_handle(&normalized.normalized_text, server);
                        self.run_statement(conn, &sql).await?;
                        Ok(Execution::Completed)
                    }
                    CommandKind::Unprepare => {
                        let Some(source) = normalized.source_handle_id else {
                            return Ok(Execution::Skipped);
                        };
                        let Some(&server) = state.prepared.get(&source) else {
                            return Ok(Execution::Skipped);
                        };
                        let sql =
                            normalizer::substitute_handle(&normalized.normalized_text, server);
                        self.run_statement(conn, &sql).await?;
                        state.prepared.remove(&source);
                        Ok(Execution::Completed)
                    }
                    CommandKind::Regular => {
                        self.run_statement(conn, &normalized.normalized_text).await?;
                        Ok(Execution::Completed)
                    }
                    CommandKind::ResetConn | CommandKind::ResetConnNonpooled => {
                        unreachable!("reset kinds are handled above")
                    }
                }
            }
        }
    }

    async fn run_statement(
        &self,
        conn: &mut Box<dyn SqlConnection>,
        sql: &str,
    ) -> Result<(), DriverError> {
        if self.settings.consume_results {
            conn.execute_drain(sql, self.settings.query_timeout).await
        } else {
            conn.execute_non_query(sql, self.settings.query_timeout).await
        }
    }

    async fn raise_trace_event(
        &self,
        kind: TraceEventKind,
        cmd: &CommandRecord,
        err: &DriverError,
    ) {
        trace_event::raise_event(
            &self.driver,
            &self.info,
            kind,
            cmd,
            &err.to_string(),
            self.settings.query_timeout,
        )
        .await;
    }

    fn log_command_error(&self, cmd: &CommandRecord, err: &DriverError) {
        macro_rules! log_at {
            ($level:ident) => {
                tracing::$level!(
                    worker = %self.name,
                    session = cmd.session_id,
                    sequence = cmd.event_sequence,
                    "command failed: {err}"
                )
            };
        }
        match self.settings.command_error_log_level {
            tracing::Level::ERROR => log_at!(error),
            tracing::Level::WARN => log_at!(warn),
            tracing::Level::INFO => log_at!(info),
            tracing::Level::DEBUG => log_at!(debug),
            tracing::Level::TRACE => log_at!(trace),
        }
    }
}

struct ThroughputStats {
    since_sample: u64,
    sample_started: Instant,
    samples: Vec<f64>,
}

impl ThroughputStats {
    fn new() -> Self {
        Self {
            since_sample: 0,
            sample_started: Instant::now(),
            samples: Vec::new(),
        }
    }

    fn record(
        &mut self,
        worker: &str,
        sample_every: u64,
        executed_total: u64,
        queue_depth: usize,
        last_sequence: i64,
    ) {
        self.since_sample += 1;
        if sample_every == 0 || self.since_sample < sample_every {
            return;
        }

        let elapsed = self.sample_started.elapsed().as_secs_f64();
        let commands_per_second = if elapsed > 0.0 {
            self.since_sample as f64 / elapsed
        } else {
            0.0
        };
        if self.samples.len() == MAX_THROUGHPUT_SAMPLES {
            self.samples.remove(0);
        }
        self.samples.push(commands_per_second);
        let average = self.samples.iter().sum::<f64>() / self.samples.len() as f64;

        tracing::info!(
            worker,
            commands_per_second,
            average_commands_per_second = average,
            executed_total,
            queue_depth,
            last_sequence,
            "worker throughput"
        );

        self.since_sample = 0;
        self.sample_started = Instant::now();
    }
}
