//! Kind-based routing of raw records to subscriptions.
//!
//! The index is built during registration. At run start it is turned into a
//! [`RoutingTable`] holding one delivery sender per subscription; the table is
//! read-only while routers use it, and dropping it closes every delivery
//! queue.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::record::{self, EVENT_KIND, Record};

/// Subscription positions per object kind and per event type.
#[derive(Debug, Default, Clone)]
pub struct RoutingIndex {
    objects: HashMap<String, Vec<usize>>,
    events: HashMap<String, Vec<usize>>,
}

impl RoutingIndex {
    /// Index `subscription` under each of its kinds, once per kind.
    pub fn insert(&mut self, subscription: usize, objects: &[String], events: &[String]) {
        for kind in objects {
            push_once(self.objects.entry(kind.clone()).or_default(), subscription);
        }
        for kind in events {
            push_once(self.events.entry(kind.clone()).or_default(), subscription);
        }
    }

    /// Bind each indexed position to its delivery sender.
    ///
    /// `senders[i]` belongs to subscription `i`.
    pub fn bind<T>(&self, senders: &[mpsc::Sender<T>]) -> RoutingTable<T> {
        let bind = |index: &HashMap<String, Vec<usize>>| {
            index
                .iter()
                .map(|(kind, subs)| {
                    let targets = subs
                        .iter()
                        .filter_map(|&i| senders.get(i).cloned())
                        .collect();
                    (kind.clone(), targets)
                })
                .collect()
        };
        RoutingTable {
            objects: bind(&self.objects),
            events: bind(&self.events),
        }
    }
}

fn push_once(subscriptions: &mut Vec<usize>, subscription: usize) {
    if !subscriptions.contains(&subscription) {
        subscriptions.push(subscription);
    }
}

/// Kind → ordered subscription senders.
pub struct RoutingTable<T = Arc<Record>> {
    objects: HashMap<String, Vec<mpsc::Sender<T>>>,
    events: HashMap<String, Vec<mpsc::Sender<T>>>,
}

impl<T> RoutingTable<T> {
    /// The subscriptions a record is delivered to.
    ///
    /// Events route by their `type`; other records by their kind. Records
    /// without a kind route nowhere.
    pub fn targets(&self, record: &Record) -> &[mpsc::Sender<T>] {
        let targets = match record::kind(record) {
            Some(EVENT_KIND) => record::get_str(record, "type").and_then(|t| self.events.get(t)),
            Some(kind) => self.objects.get(kind),
            None => None,
        };
        targets.map(Vec::as_slice).unwrap_or_default()
    }
}
