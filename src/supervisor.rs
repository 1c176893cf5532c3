//! Monitoring supervisor - one entity monitor per subscribed character
//!
//! A single loop consumes the registry's subscription events and is the only
//! code that touches the monitor map, which keeps at most one monitor per
//! character without further locking. Every monitor runs under a child of the
//! supervisor's root token and on its task tracker, so [`SupervisorHandle::shutdown`]
//! can cancel everything and wait for it.

use crate::config::LogRootProvider;
use crate::error::{Error, Result};
use crate::monitor::{EntityMonitor, MonitorContext, MonitorEventRx, MonitorTiming};
use crate::notification::NotificationSink;
use crate::registry::{SubscriptionEvent, SubscriptionEvents, SubscriptionRegistry};
use crate::EntityId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct MonitoringSupervisor {
    ctx: MonitorContext,
    shutdown: CancellationToken,
}

impl MonitoringSupervisor {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        log_root: Arc<dyn LogRootProvider>,
        notifier: Arc<dyn NotificationSink>,
        timing: MonitorTiming,
    ) -> Self {
        Self {
            ctx: MonitorContext::new(registry, log_root, notifier, timing),
            shutdown: CancellationToken::new(),
        }
    }

    /// Lifecycle events; subscribe before [`spawn`](Self::spawn) to see the
    /// first monitor starting.
    pub fn subscribe_events(&self) -> MonitorEventRx {
        self.ctx.subscribe_events()
    }

    /// Start the supervisor loop on the current runtime.
    pub fn spawn(self, events: SubscriptionEvents) -> SupervisorHandle {
        let (active_tx, active_rx) = watch::channel(Vec::new());
        let task = tokio::spawn(supervise(
            self.ctx.clone(),
            self.shutdown.clone(),
            events,
            active_tx,
        ));
        SupervisorHandle {
            ctx: self.ctx,
            shutdown: self.shutdown,
            active: active_rx,
            task,
        }
    }
}

pub struct SupervisorHandle {
    ctx: MonitorContext,
    shutdown: CancellationToken,
    active: watch::Receiver<Vec<EntityId>>,
    task: JoinHandle<Result<()>>,
}

impl SupervisorHandle {
    /// Characters that currently have a monitor, ascending.
    pub fn active_monitors(&self) -> Vec<EntityId> {
        self.active.borrow().clone()
    }

    /// Resolves once the supervisor has stopped, either through
    /// [`shutdown`](Self::shutdown) or a fatal error.
    pub async fn cancelled(&self) {
        self.shutdown.cancelled().await
    }

    /// Cancel every monitor and worker and wait for all of them to finish.
    ///
    /// Returns the error that stopped the supervisor loop, if any.
    pub async fn shutdown(self) -> Result<()> {
        info!("shutting down monitoring supervisor");
        self.shutdown.cancel();
        let result = self.task.await;

        self.ctx.tracker.close();
        self.ctx.tracker.wait().await;
        debug!("all monitors and workers stopped");

        result?
    }
}

struct RunningMonitor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

async fn supervise(
    ctx: MonitorContext,
    shutdown: CancellationToken,
    mut events: SubscriptionEvents,
    active: watch::Sender<Vec<EntityId>>,
) -> Result<()> {
    let mut monitors: HashMap<EntityId, RunningMonitor> = HashMap::new();

    let result = loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break Ok(()),
            event = events.recv() => event,
        };

        match event {
            Some(SubscriptionEvent::Subscribed(id)) => {
                if let Some(existing) = monitors.get(&id) {
                    if !existing.task.is_finished() {
                        warn!(entity = %id, "monitor already running; ignoring subscribe");
                        continue;
                    }
                    debug!(entity = %id, "replacing finished monitor");
                }

                info!(entity = %id, "starting monitor");
                let cancel = shutdown.child_token();
                let monitor = EntityMonitor::new(id, ctx.clone(), cancel.clone());
                let task = ctx.tracker.spawn(monitor.run());
                monitors.insert(id, RunningMonitor { cancel, task });
            }
            Some(SubscriptionEvent::Unsubscribed(id)) => {
                let Some(monitor) = monitors.remove(&id) else {
                    warn!(entity = %id, "no monitor running; ignoring unsubscribe");
                    continue;
                };
                info!(entity = %id, "stopping monitor");
                monitor.cancel.cancel();
                // A resubscribe must not overlap with the old monitor's workers.
                if let Err(e) = monitor.task.await {
                    warn!(entity = %id, error = %e, "monitor task failed");
                }
            }
            None => {
                error!("subscription event stream closed while supervisor was running");
                break Err(Error::EventStreamClosed);
            }
        }

        let mut ids: Vec<_> = monitors.keys().copied().collect();
        ids.sort();
        active.send_replace(ids);
    };

    shutdown.cancel();
    active.send_replace(Vec::new());
    result
}
