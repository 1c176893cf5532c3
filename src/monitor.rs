//! Entity monitor - per-character discovery loop and tailing workers
//!
//! Every discovery tick the monitor re-reads the character's rules and, per
//! [`LogCategory`], moves between `Idle` and `Tailing(path)`:
//!
//! - category not needed by any enabled rule: stop its worker
//! - needed, newer live file found: stop the old worker, await it, start a new one
//! - needed, same file or nothing found: keep the current state
//!
//! Workers are children of the monitor's cancellation token, which is itself a
//! child of the supervisor's. Cancelling the monitor therefore stops every worker.

use crate::config::LogRootProvider;
use crate::discovery::find_latest_log;
use crate::notification::NotificationSink;
use crate::registry::SubscriptionRegistry;
use crate::rules::LineMatcher;
use crate::tail::{DEFAULT_POLL_INTERVAL, TailReader};
use crate::{EntityId, LogCategory, NotificationRuleSet};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Default period between discovery cycles.
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(10);

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorTiming {
    pub discovery_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for MonitorTiming {
    fn default() -> Self {
        Self {
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Lifecycle events published by monitors.
///
/// `WorkerStopped` is only sent once the worker task has finished and closed
/// its file, so for one category it always precedes the next `WorkerStarted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    MonitorStarted {
        entity: EntityId,
    },
    MonitorStopped {
        entity: EntityId,
    },
    WorkerStarted {
        entity: EntityId,
        category: LogCategory,
        path: PathBuf,
    },
    WorkerStopped {
        entity: EntityId,
        category: LogCategory,
        path: PathBuf,
    },
}

/// Receiver for [`MonitorEvent`]s.
///
/// Lagged receivers skip the missed events; the stream is informational.
#[derive(Debug)]
pub struct MonitorEventRx {
    rx: broadcast::Receiver<MonitorEvent>,
}

impl MonitorEventRx {
    pub async fn recv(&mut self) -> Option<MonitorEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Collaborators shared by the supervisor and all of its monitors.
#[derive(Clone)]
pub(crate) struct MonitorContext {
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) log_root: Arc<dyn LogRootProvider>,
    pub(crate) notifier: Arc<dyn NotificationSink>,
    pub(crate) timing: MonitorTiming,
    pub(crate) tracker: TaskTracker,
    pub(crate) events: broadcast::Sender<MonitorEvent>,
}

impl MonitorContext {
    pub(crate) fn new(
        registry: Arc<SubscriptionRegistry>,
        log_root: Arc<dyn LogRootProvider>,
        notifier: Arc<dyn NotificationSink>,
        timing: MonitorTiming,
    ) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_BUFFER);
        Self {
            registry,
            log_root,
            notifier,
            timing,
            tracker: TaskTracker::new(),
            events,
        }
    }

    pub(crate) fn subscribe_events(&self) -> MonitorEventRx {
        MonitorEventRx {
            rx: self.events.subscribe(),
        }
    }

    fn emit(&self, event: MonitorEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

/// A running worker for one (entity, category).
struct ActiveLog {
    path: PathBuf,
    cancel: CancellationToken,
    rules: watch::Sender<NotificationRuleSet>,
    task: JoinHandle<()>,
}

pub(crate) struct EntityMonitor {
    entity: EntityId,
    ctx: MonitorContext,
    cancel: CancellationToken,
    active: HashMap<LogCategory, ActiveLog>,
}

impl EntityMonitor {
    pub(crate) fn new(entity: EntityId, ctx: MonitorContext, cancel: CancellationToken) -> Self {
        Self {
            entity,
            ctx,
            cancel,
            active: HashMap::new(),
        }
    }

    /// Discovery loop. Returns once cancelled or once the character is no
    /// longer subscribed, after every worker has stopped.
    pub(crate) async fn run(mut self) {
        debug!(entity = %self.entity, "monitor run loop started");
        self.ctx.emit(MonitorEvent::MonitorStarted {
            entity: self.entity,
        });

        // First tick fires immediately.
        let mut ticker = tokio::time::interval(self.ctx.timing.discovery_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.check_logs().await {
                        break;
                    }
                }
            }
        }

        debug!(entity = %self.entity, "monitor run loop stopping");
        self.cancel.cancel();
        self.stop_all_workers().await;
        self.ctx.emit(MonitorEvent::MonitorStopped {
            entity: self.entity,
        });
    }

    /// One discovery cycle. Returns `false` if the monitor should stop.
    async fn check_logs(&mut self) -> bool {
        let Some(rules) = self.ctx.registry.get_settings(self.entity) else {
            info!(entity = %self.entity, "character no longer subscribed; stopping monitor");
            return false;
        };

        let log_root = self.ctx.log_root.log_root();
        if log_root.is_none() && LogCategory::ALL.iter().any(|c| rules.requires(*c)) {
            debug!(entity = %self.entity, "log path not configured; monitor not ready");
        }

        for category in LogCategory::ALL {
            if self.cancel.is_cancelled() {
                break;
            }
            self.reconcile(category, rules, log_root.as_deref()).await;
        }
        true
    }

    /// Bring one category in line with the current rules and live file.
    async fn reconcile(
        &mut self,
        category: LogCategory,
        rules: NotificationRuleSet,
        log_root: Option<&Path>,
    ) {
        // A worker that ended on its own hit an I/O error; the category is idle again.
        if self
            .active
            .get(&category)
            .is_some_and(|active| active.task.is_finished())
            && let Some(active) = self.active.remove(&category)
        {
            info!(entity = %self.entity, %category, path = %active.path.display(), "log no longer tailable");
            self.stop_worker(category, active).await;
        }

        if !rules.requires(category) {
            if let Some(active) = self.active.remove(&category) {
                info!(entity = %self.entity, %category, "no enabled rule needs this log; stopping worker");
                self.stop_worker(category, active).await;
            }
            return;
        }

        if let Some(active) = self.active.get(&category) {
            active.rules.send_if_modified(|current| {
                let changed = *current != rules;
                *current = rules;
                changed
            });
        }

        let Some(log_root) = log_root else {
            return;
        };
        let dir = log_root.join(category.dir_name());
        let Some(latest) = find_latest_log(&dir, self.entity, category) else {
            return;
        };

        if self
            .active
            .get(&category)
            .is_some_and(|active| active.path == latest)
        {
            return;
        }

        info!(
            entity = %self.entity,
            %category,
            file = %latest.file_name().unwrap_or_default().to_string_lossy(),
            "new log detected for monitoring"
        );
        if let Some(previous) = self.active.remove(&category) {
            self.stop_worker(category, previous).await;
        }
        self.start_worker(category, latest, rules).await;
    }

    async fn start_worker(
        &mut self,
        category: LogCategory,
        path: PathBuf,
        rules: NotificationRuleSet,
    ) {
        debug_assert!(
            !self.active.contains_key(&category),
            "second worker for an already tailed category"
        );

        // Open before announcing the worker so the start offset is fixed here.
        let reader = match TailReader::open(
            &path,
            category.encoding(),
            self.ctx.timing.poll_interval,
        )
        .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(entity = %self.entity, %category, path = %path.display(), error = %e, "failed to open log");
                return;
            }
        };

        let cancel = self.cancel.child_token();
        let (rules_tx, rules_rx) = watch::channel(rules);
        let worker = Worker {
            entity: self.entity,
            category,
            reader,
            rules: rules_rx,
            notifier: Arc::clone(&self.ctx.notifier),
            cancel: cancel.clone(),
        };
        let task = self.ctx.tracker.spawn(worker.run());

        self.active.insert(
            category,
            ActiveLog {
                path: path.clone(),
                cancel,
                rules: rules_tx,
                task,
            },
        );
        self.ctx.emit(MonitorEvent::WorkerStarted {
            entity: self.entity,
            category,
            path,
        });
    }

    /// Cancel a worker and wait until it has dropped its file handle.
    async fn stop_worker(&mut self, category: LogCategory, active: ActiveLog) {
        active.cancel.cancel();
        if let Err(e) = active.task.await {
            warn!(entity = %self.entity, %category, error = %e, "log worker task failed");
        }
        self.ctx.emit(MonitorEvent::WorkerStopped {
            entity: self.entity,
            category,
            path: active.path,
        });
    }

    async fn stop_all_workers(&mut self) {
        let mut active: Vec<_> = self.active.drain().collect();
        active.sort_by_key(|(category, _)| *category);
        for (category, log) in active {
            self.stop_worker(category, log).await;
        }
    }
}

/// Tails one live file and turns matching lines into notifications.
struct Worker {
    entity: EntityId,
    category: LogCategory,
    reader: TailReader,
    rules: watch::Receiver<NotificationRuleSet>,
    notifier: Arc<dyn NotificationSink>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        info!(
            entity = %self.entity,
            category = %self.category,
            path = %self.reader.path().display(),
            offset = self.reader.offset(),
            "log worker started"
        );
        let mut matcher = LineMatcher::new(self.entity, self.category);

        loop {
            let line = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                line = self.reader.next_line() => line,
            };

            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(
                        entity = %self.entity,
                        category = %self.category,
                        error = %e,
                        "error reading log; worker exiting"
                    );
                    break;
                }
            };

            let rules = *self.rules.borrow_and_update();
            for notification in matcher.evaluate(&rules, &line) {
                info!(entity = %self.entity, title = %notification.title, "notification");
                self.notifier.notify(notification);
            }
        }

        info!(
            entity = %self.entity,
            category = %self.category,
            path = %self.reader.path().display(),
            "log worker stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Rule;
    use crate::config::SharedLogRoot;
    use crate::notification::ChannelNotifier;
    use tempfile::TempDir;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn context(registry: &Arc<SubscriptionRegistry>, root: Option<PathBuf>) -> MonitorContext {
        let (notifier, _rx) = ChannelNotifier::new();
        MonitorContext::new(
            Arc::clone(registry),
            Arc::new(SharedLogRoot::new(root)),
            Arc::new(notifier),
            MonitorTiming {
                discovery_interval: Duration::from_millis(50),
                poll_interval: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test]
    async fn monitor_stops_itself_when_not_subscribed() {
        let (registry, _events) = SubscriptionRegistry::new();
        let ctx = context(&registry, None);
        let mut rx = ctx.subscribe_events();

        let monitor = EntityMonitor::new(EntityId(42), ctx, CancellationToken::new());
        timeout(WAIT, monitor.run()).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(MonitorEvent::MonitorStarted {
                entity: EntityId(42)
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(MonitorEvent::MonitorStopped {
                entity: EntityId(42)
            })
        );
    }

    #[tokio::test]
    async fn cancelling_monitor_stops_its_workers() {
        let tmp = TempDir::new().unwrap();
        let gamelogs = tmp.path().join("Gamelogs");
        std::fs::create_dir(&gamelogs).unwrap();
        let log = gamelogs.join("20240101_120000_42.txt");
        std::fs::write(&log, "").unwrap();

        let (registry, _events) = SubscriptionRegistry::new();
        registry
            .subscribe(EntityId(42), NotificationRuleSet::default().with(Rule::CargoFull))
            .unwrap();
        let ctx = context(&registry, Some(tmp.path().to_path_buf()));
        let mut rx = ctx.subscribe_events();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(EntityMonitor::new(EntityId(42), ctx, cancel.clone()).run());

        let mut seen = Vec::new();
        while !matches!(seen.last(), Some(MonitorEvent::WorkerStarted { .. })) {
            seen.push(timeout(WAIT, rx.recv()).await.unwrap().unwrap());
        }

        cancel.cancel();
        timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(
            rx.recv().await,
            Some(MonitorEvent::WorkerStopped {
                entity: EntityId(42),
                category: LogCategory::Gamelog,
                path: log,
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(MonitorEvent::MonitorStopped {
                entity: EntityId(42)
            })
        );
    }
}
