//! Subscription table.
//!
//! Tracks active `eth_subscribe` subscriptions by id, routes pushes to their
//! receivers, and keeps what is needed to re-subscribe after a reconnect.
//! A node may push before the `eth_subscribe` reply has been handled; such
//! pushes are held (up to [`EARLY_PUSH_LIMIT`]) and flushed on register.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::link::Medium;

/// A unique subscription ID returned by `eth_subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata for a single subscription.
#[derive(Clone)]
struct SubscriptionEntry {
    /// Medium the subscription was opened on.
    medium: Medium,
    /// The subscription type (e.g. `"newHeads"`, `"logs"`).
    kind: String,
    /// Parameters for re-subscribing (e.g. filter params).
    params: Vec<Value>,
    /// Channel to forward incoming messages to the caller.
    sender: mpsc::UnboundedSender<Value>,
}

/// A subscription to re-open after a reconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSubscription {
    pub id: SubscriptionId,
    pub kind: String,
    pub params: Vec<Value>,
}

/// Pushes held for ids nobody has registered yet. Oldest go first.
pub const EARLY_PUSH_LIMIT: usize = 64;

#[derive(Default)]
struct Table {
    entries: HashMap<SubscriptionId, SubscriptionEntry>,
    early: VecDeque<(SubscriptionId, Value)>,
}

impl Table {
    /// Hand every held push for `id` to its entry, in arrival order.
    fn flush_early(&mut self, id: &SubscriptionId) {
        let Some(entry) = self.entries.get(id) else {
            return;
        };
        let sender = entry.sender.clone();
        self.early.retain(|(early_id, message)| {
            if early_id == id {
                let _ = sender.send(message.clone());
                false
            } else {
                true
            }
        });
    }
}

/// Manages active subscriptions and supports re-subscription.
#[derive(Clone, Default)]
pub struct SubscriptionManager {
    table: Arc<Mutex<Table>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscription.
    pub fn register(
        &self,
        id: SubscriptionId,
        medium: Medium,
        kind: String,
        params: Vec<Value>,
    ) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = self.table.lock().unwrap();
        table.entries.insert(
            id.clone(),
            SubscriptionEntry {
                medium,
                kind,
                params,
                sender: tx,
            },
        );
        table.flush_early(&id);
        rx
    }

    /// Forward an incoming push to its subscription.
    ///
    /// Returns `false` if the id is unknown; the push is then held until the
    /// id is registered. A subscription whose receiver was dropped is removed.
    pub fn dispatch(&self, id: &SubscriptionId, message: Value) -> bool {
        let mut guard = self.table.lock().unwrap();
        let table = &mut *guard;
        let Some(entry) = table.entries.get(id) else {
            if table.early.len() == EARLY_PUSH_LIMIT {
                table.early.pop_front();
            }
            table.early.push_back((id.clone(), message));
            return false;
        };
        if entry.sender.send(message).is_err() {
            table.entries.remove(id);
        }
        true
    }

    /// Move a subscription to the id a node handed out on re-subscribe.
    pub fn rekey(&self, old: &SubscriptionId, new: SubscriptionId) -> bool {
        let mut table = self.table.lock().unwrap();
        match table.entries.remove(old) {
            Some(entry) => {
                table.entries.insert(new.clone(), entry);
                table.flush_early(&new);
                true
            }
            None => false,
        }
    }

    /// Remove a subscription (e.g. after `eth_unsubscribe`).
    pub fn remove(&self, id: &SubscriptionId) -> bool {
        let mut table = self.table.lock().unwrap();
        table.early.retain(|(early_id, _)| early_id != id);
        table.entries.remove(id).is_some()
    }

    /// Subscriptions opened on `medium`, for re-subscribing after reconnect.
    pub fn active_on(&self, medium: Medium) -> Vec<ActiveSubscription> {
        self.table
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|(_, e)| e.medium == medium)
            .map(|(id, e)| ActiveSubscription {
                id: id.clone(),
                kind: e.kind.clone(),
                params: e.params.clone(),
            })
            .collect()
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        let mut table = self.table.lock().unwrap();
        table.entries.clear();
        table.early.clear();
    }

    /// Number of active subscriptions.
    pub fn len(&self) -> usize {
        self.table.lock().unwrap().entries.len()
    }

    /// Returns `true` if there are no active subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_dispatch() {
        let mgr = SubscriptionManager::new();
        let id = SubscriptionId("0xdeadbeef".into());
        let mut rx = mgr.register(id.clone(), Medium::Ws, "newHeads".into(), vec![]);

        assert!(mgr.dispatch(&id, serde_json::json!({"number": "0x1"})));

        let msg = rx.try_recv().unwrap();
        assert_eq!(msg["number"], "0x1");
    }

    #[test]
    fn dispatch_unknown_id() {
        let mgr = SubscriptionManager::new();
        assert!(!mgr.dispatch(&SubscriptionId("0x9".into()), serde_json::json!(null)));
    }

    #[test]
    fn push_before_register_is_delivered_first() {
        let mgr = SubscriptionManager::new();
        let id = SubscriptionId("0xs1".into());
        assert!(!mgr.dispatch(&id, serde_json::json!({"number": "0x1"})));
        assert!(!mgr.dispatch(&SubscriptionId("0xother".into()), serde_json::json!(0)));

        let mut rx = mgr.register(id.clone(), Medium::Ws, "newHeads".into(), vec![]);
        assert!(mgr.dispatch(&id, serde_json::json!({"number": "0x2"})));
        assert_eq!(rx.try_recv().unwrap()["number"], "0x1");
        assert_eq!(rx.try_recv().unwrap()["number"], "0x2");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn early_pushes_are_bounded() {
        let mgr = SubscriptionManager::new();
        let id = SubscriptionId("0xs1".into());
        for n in 0..EARLY_PUSH_LIMIT + 3 {
            mgr.dispatch(&id, serde_json::json!(n));
        }
        let mut rx = mgr.register(id, Medium::Ws, "newHeads".into(), vec![]);
        assert_eq!(rx.try_recv().unwrap(), 3);
        let mut held = 1;
        while rx.try_recv().is_ok() {
            held += 1;
        }
        assert_eq!(held, EARLY_PUSH_LIMIT);
    }

    #[test]
    fn removed_id_drops_held_pushes() {
        let mgr = SubscriptionManager::new();
        let id = SubscriptionId("0xs1".into());
        mgr.dispatch(&id, serde_json::json!(1));
        mgr.remove(&id);
        let mut rx = mgr.register(id, Medium::Ws, "newHeads".into(), vec![]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_removes_entry() {
        let mgr = SubscriptionManager::new();
        let id = SubscriptionId("0x1".into());
        drop(mgr.register(id.clone(), Medium::Ipc, "logs".into(), vec![]));
        mgr.dispatch(&id, serde_json::json!({}));
        assert!(mgr.is_empty());
    }

    #[test]
    fn rekey_keeps_receiver() {
        let mgr = SubscriptionManager::new();
        let old = SubscriptionId("0xa".into());
        let new = SubscriptionId("0xb".into());
        let mut rx = mgr.register(old.clone(), Medium::Ws, "newHeads".into(), vec![]);
        assert!(mgr.rekey(&old, new.clone()));
        assert!(!mgr.dispatch(&old, serde_json::json!(1)));
        assert!(mgr.dispatch(&new, serde_json::json!(2)));
        assert_eq!(rx.try_recv().unwrap(), 2);
    }

    #[test]
    fn active_subscriptions_by_medium() {
        let mgr = SubscriptionManager::new();
        mgr.register(SubscriptionId("0xa".into()), Medium::Ws, "newHeads".into(), vec![]);
        mgr.register(
            SubscriptionId("0xb".into()),
            Medium::Ipc,
            "logs".into(),
            vec![serde_json::json!({})],
        );

        let ws = mgr.active_on(Medium::Ws);
        assert_eq!(ws.len(), 1);
        assert_eq!(ws[0].kind, "newHeads");
        assert_eq!(mgr.active_on(Medium::Ipc).len(), 1);
        mgr.clear();
        assert!(mgr.is_empty());
    }
}
