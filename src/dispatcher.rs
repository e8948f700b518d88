use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    config::Config,
    driver::{ConnectionInfo, SqlDriver},
    record::CommandRecord,
    worker::{ReplayWorker, WorkerSettings},
};

/// Routes captured commands to per-session workers.
///
/// A worker is created the first time its session id appears and destroyed
/// when the replay ends or the session has been idle past the configured
/// timeout. The enqueue path is responsible for restarting parked workers,
/// so `dispatch` always appends and then starts.
pub struct Dispatcher {
    driver: Arc<dyn SqlDriver>,
    info: ConnectionInfo,
    settings: WorkerSettings,
    workers: Mutex<HashMap<i64, Arc<ReplayWorker>>>,
}

impl Dispatcher {
    pub fn new(driver: Arc<dyn SqlDriver>, info: ConnectionInfo, settings: WorkerSettings) -> Self {
        Self {
            driver,
            info,
            settings,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config, driver: Arc<dyn SqlDriver>) -> Self {
        let info = ConnectionInfo {
            connection_string: config.target.connection_string.clone(),
            default_app_name: config.target.application_name.clone(),
        };
        Self::new(driver, info, WorkerSettings::from_config(config))
    }

    /// Enqueues a command on its session's worker, creating the worker on
    /// first sight.
    pub fn dispatch(&self, cmd: CommandRecord) {
        let worker = {
            let mut workers = self.workers.lock().expect("worker map lock poisoned");
            Arc::clone(workers.entry(cmd.session_id).or_insert_with(|| {
                ReplayWorker::new(
                    format!("session-{}", cmd.session_id),
                    Arc::clone(&self.driver),
                    self.info.clone(),
                    self.settings.clone(),
                )
            }))
        };
        worker.append(cmd);
        worker.start();
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().expect("worker map lock poisoned").len()
    }

    pub fn worker(&self, session_id: i64) -> Option<Arc<ReplayWorker>> {
        self.workers
            .lock()
            .expect("worker map lock poisoned")
            .get(&session_id)
            .cloned()
    }

    /// True when every worker has drained its queue and parked (or stopped).
    pub fn is_idle(&self) -> bool {
        self.workers
            .lock()
            .expect("worker map lock poisoned")
            .values()
            .all(|worker| worker.is_stopped() || worker.is_idle())
    }

    /// Polls until every worker is idle. Intended for hosts that enqueue an
    /// entire capture up front and then wait for the replay to finish.
    pub async fn wait_until_idle(&self) {
        loop {
            if self.is_idle() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Disposes workers that have been idle past `idle_timeout`, returning
    /// how many were removed.
    pub async fn remove_idle(&self, idle_timeout: Duration) -> usize {
        let expired: Vec<Arc<ReplayWorker>> = {
            let mut workers = self.workers.lock().expect("worker map lock poisoned");
            let expired_ids: Vec<i64> = workers
                .iter()
                .filter(|(_, worker)| {
                    (worker.is_stopped() || worker.is_idle())
                        && worker.idle_duration() >= idle_timeout
                })
                .map(|(id, _)| *id)
                .collect();
            expired_ids
                .into_iter()
                .filter_map(|id| workers.remove(&id))
                .collect()
        };

        let removed = expired.len();
        for worker in expired {
            tracing::debug!(worker = worker.name(), "removing idle worker");
            worker.dispose().await;
        }
        removed
    }

    /// Stops and disposes every worker.
    pub async fn shutdown(&self) {
        let workers: Vec<Arc<ReplayWorker>> = {
            let mut map = self.workers.lock().expect("worker map lock poisoned");
            map.drain().map(|(_, worker)| worker).collect()
        };
        // Signal everything first so slow disposals don't serialize stops.
        for worker in &workers {
            worker.stop();
        }
        for worker in workers {
            worker.dispose().await;
        }
    }
}
