//! Subscription registry - which characters are watched and with which rules
//!
//! The registry is the only state shared between the supervisor, every entity
//! monitor and the config reloader. All access goes through a single
//! reader/writer lock; readers always receive a copy of the rule set.

use crate::error::{Error, Result};
use crate::{EntityId, NotificationRuleSet};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Subscription change emitted to the monitoring supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Subscribed(EntityId),
    Unsubscribed(EntityId),
}

/// Receiving end of the registry's event stream.
///
/// Subscribe and unsubscribe events share one ordered channel, so the consumer
/// always sees them in the order the registry applied them.
#[derive(Debug)]
pub struct SubscriptionEvents {
    rx: mpsc::UnboundedReceiver<SubscriptionEvent>,
}

impl SubscriptionEvents {
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.rx.recv().await
    }
}

#[derive(Debug)]
pub struct SubscriptionRegistry {
    /// Presence of a key is the subscription predicate.
    subscriptions: RwLock<HashMap<EntityId, NotificationRuleSet>>,
    events: mpsc::UnboundedSender<SubscriptionEvent>,
}

impl SubscriptionRegistry {
    /// Create an empty registry and the event stream the supervisor consumes.
    pub fn new() -> (Arc<Self>, SubscriptionEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            subscriptions: RwLock::new(HashMap::new()),
            events: tx,
        });
        (registry, SubscriptionEvents { rx })
    }

    /// Insert or replace the rules for `id` and announce the subscription.
    ///
    /// The rules are stored even when the event cannot be delivered; the error
    /// signals that the supervisor is gone, which is a lifecycle bug.
    pub fn subscribe(&self, id: EntityId, rules: NotificationRuleSet) -> Result<()> {
        let mut subs = self.subscriptions.write();
        info!(entity = %id, "subscribing character");
        subs.insert(id, rules);
        self.emit(SubscriptionEvent::Subscribed(id))
    }

    /// Remove `id`. No-op (and no event) if it was not subscribed.
    pub fn unsubscribe(&self, id: EntityId) -> Result<()> {
        let mut subs = self.subscriptions.write();
        if subs.remove(&id).is_none() {
            warn!(entity = %id, "character not subscribed; ignoring unsubscribe");
            return Ok(());
        }
        info!(entity = %id, "unsubscribing character");
        self.emit(SubscriptionEvent::Unsubscribed(id))
    }

    pub fn is_subscribed(&self, id: EntityId) -> bool {
        self.subscriptions.read().contains_key(&id)
    }

    /// Copy of the rules for `id`, or `None` if not subscribed.
    pub fn get_settings(&self, id: EntityId) -> Option<NotificationRuleSet> {
        self.subscriptions.read().get(&id).copied()
    }

    /// Replace the rules of an existing subscription. Returns `false` (and
    /// changes nothing) if `id` is not subscribed.
    pub fn update_settings(&self, id: EntityId, rules: NotificationRuleSet) -> bool {
        let mut subs = self.subscriptions.write();
        match subs.get_mut(&id) {
            Some(current) => {
                debug!(entity = %id, "updating settings");
                *current = rules;
                true
            }
            None => false,
        }
    }

    /// Subscribed IDs in ascending order.
    pub fn subscribed_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<_> = self.subscriptions.read().keys().copied().collect();
        ids.sort();
        ids
    }

    // Called with the write lock held so event order matches mutation order.
    fn emit(&self, event: SubscriptionEvent) -> Result<()> {
        self.events.send(event).map_err(|_| {
            error!(?event, "subscription event channel closed");
            Error::SupervisorGone
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Rule;

    fn cargo() -> NotificationRuleSet {
        NotificationRuleSet::default().with(Rule::CargoFull)
    }

    #[test]
    fn subscribe_emits_event_and_stores_rules() {
        let (registry, mut events) = SubscriptionRegistry::new();
        registry.subscribe(EntityId(501), cargo()).unwrap();

        assert!(registry.is_subscribed(EntityId(501)));
        assert_eq!(registry.get_settings(EntityId(501)), Some(cargo()));
        assert_eq!(
            events.rx.try_recv().unwrap(),
            SubscriptionEvent::Subscribed(EntityId(501))
        );
    }

    #[test]
    fn all_false_rule_set_is_a_valid_subscription() {
        let (registry, _events) = SubscriptionRegistry::new();
        registry
            .subscribe(EntityId(7), NotificationRuleSet::default())
            .unwrap();
        assert!(registry.is_subscribed(EntityId(7)));
    }

    #[test]
    fn resubscribe_replaces_rules_and_emits_again() {
        let (registry, mut events) = SubscriptionRegistry::new();
        registry.subscribe(EntityId(501), cargo()).unwrap();
        let jump = NotificationRuleSet::default().with(Rule::AutopilotJump);
        registry.subscribe(EntityId(501), jump).unwrap();

        assert_eq!(registry.get_settings(EntityId(501)), Some(jump));
        assert!(events.rx.try_recv().is_ok());
        assert!(events.rx.try_recv().is_ok());
    }

    #[test]
    fn unsubscribe_unknown_is_silent() {
        let (registry, mut events) = SubscriptionRegistry::new();
        registry.unsubscribe(EntityId(1)).unwrap();
        assert!(events.rx.try_recv().is_err());
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn unsubscribe_unknown_logs_warning() {
        let (registry, _events) = SubscriptionRegistry::new();
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            registry.unsubscribe(EntityId(404)).unwrap();
        });

        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        assert!(output.contains("WARN"), "no warning logged: {output}");
        assert!(output.contains("ignoring unsubscribe"));
    }

    #[test]
    fn unsubscribe_removes_and_emits() {
        let (registry, mut events) = SubscriptionRegistry::new();
        registry.subscribe(EntityId(501), cargo()).unwrap();
        registry.unsubscribe(EntityId(501)).unwrap();

        assert!(!registry.is_subscribed(EntityId(501)));
        assert_eq!(registry.get_settings(EntityId(501)), None);
        assert_eq!(
            events.rx.try_recv().unwrap(),
            SubscriptionEvent::Subscribed(EntityId(501))
        );
        assert_eq!(
            events.rx.try_recv().unwrap(),
            SubscriptionEvent::Unsubscribed(EntityId(501))
        );
    }

    #[test]
    fn update_settings_requires_existing_subscription() {
        let (registry, mut events) = SubscriptionRegistry::new();
        assert!(!registry.update_settings(EntityId(501), cargo()));
        assert!(!registry.is_subscribed(EntityId(501)));

        registry
            .subscribe(EntityId(501), NotificationRuleSet::default())
            .unwrap();
        let _ = events.rx.try_recv();
        assert!(registry.update_settings(EntityId(501), cargo()));
        assert_eq!(registry.get_settings(EntityId(501)), Some(cargo()));
        // Updates are not subscription events.
        assert!(events.rx.try_recv().is_err());
    }

    #[test]
    fn returned_settings_are_independent_copies() {
        let (registry, _events) = SubscriptionRegistry::new();
        registry.subscribe(EntityId(501), cargo()).unwrap();

        let mut copy = registry.get_settings(EntityId(501)).unwrap();
        copy.set(Rule::CargoFull, false);
        assert_eq!(registry.get_settings(EntityId(501)), Some(cargo()));
    }

    #[test]
    fn closed_event_stream_is_reported() {
        let (registry, events) = SubscriptionRegistry::new();
        drop(events);

        let err = registry.subscribe(EntityId(501), cargo()).unwrap_err();
        assert!(matches!(err, Error::SupervisorGone));
        // The mutation itself still happened.
        assert!(registry.is_subscribed(EntityId(501)));
    }

    #[test]
    fn subscribed_ids_are_sorted() {
        let (registry, _events) = SubscriptionRegistry::new();
        for id in [30, 10, 20] {
            registry.subscribe(EntityId(id), cargo()).unwrap();
        }
        assert_eq!(
            registry.subscribed_ids(),
            vec![EntityId(10), EntityId(20), EntityId(30)]
        );
    }

    #[test]
    fn concurrent_readers_never_see_partial_writes() {
        let (registry, _events) = SubscriptionRegistry::new();
        let all = Rule::ALL
            .iter()
            .fold(NotificationRuleSet::default(), |r, rule| r.with(*rule));
        registry
            .subscribe(EntityId(1), NotificationRuleSet::default())
            .unwrap();

        std::thread::scope(|s| {
            let writer = &registry;
            s.spawn(move || {
                for i in 0..2000 {
                    let rules = if i % 2 == 0 {
                        all
                    } else {
                        NotificationRuleSet::default()
                    };
                    writer.update_settings(EntityId(1), rules);
                }
            });
            for _ in 0..4 {
                let reader = &registry;
                s.spawn(move || {
                    for _ in 0..2000 {
                        let rules = reader.get_settings(EntityId(1)).unwrap();
                        assert!(rules == all || rules == NotificationRuleSet::default());
                    }
                });
            }
        });
    }
}
