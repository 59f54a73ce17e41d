// Copyright (C) 2026-present The rcaflow Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::PeerId;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use std::{collections::HashMap, fmt::Debug};
use tracing::info;

/// Capability used by ingestion tasks to report that a peer is alive
pub trait PeerLivenessTracker: Debug + Send + Sync {
    fn record_contact(&self, peer: PeerId, graph_node: &str, timestamp: DateTime<Utc>);
}

/// In-memory liveness state: the last time each graph node of each peer
/// published data.
#[derive(Debug, Default)]
pub struct NodeStateTracker {
    contacts: RwLock<HashMap<PeerId, HashMap<String, DateTime<Utc>>>>,
}

impl NodeStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent contact with the peer across all of its graph nodes
    pub fn last_contact(&self, peer: &PeerId) -> Option<DateTime<Utc>> {
        self.contacts
            .read()
            .get(peer)
            .and_then(|nodes| nodes.values().max().copied())
    }

    pub fn last_contact_for(&self, peer: &PeerId, graph_node: &str) -> Option<DateTime<Utc>> {
        self.contacts
            .read()
            .get(peer)
            .and_then(|nodes| nodes.get(graph_node).copied())
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers = self.contacts.read().keys().copied().collect::<Vec<_>>();
        peers.sort();
        peers
    }

    /// Forget peers that have not been heard of for longer than `max_idle`
    /// before `now`. Returns the removed peers.
    pub fn purge_inactive(&self, now: DateTime<Utc>, max_idle: TimeDelta) -> Vec<PeerId> {
        let mut purged = vec![];
        self.contacts.write().retain(|peer, nodes| {
            let last = nodes.values().max().copied();
            match last {
                Some(last) if now - last <= max_idle => true,
                _ => {
                    purged.push(*peer);
                    false
                }
            }
        });
        if !purged.is_empty() {
            purged.sort();
            info!(
                "Purged {} peers that were inactive for more than {max_idle}",
                purged.len()
            );
        }
        purged
    }
}

impl PeerLivenessTracker for NodeStateTracker {
    fn record_contact(&self, peer: PeerId, graph_node: &str, timestamp: DateTime<Utc>) {
        let mut contacts = self.contacts.write();
        let nodes = contacts.entry(peer).or_default();
        match nodes.get_mut(graph_node) {
            Some(last) => {
                if *last < timestamp {
                    *last = timestamp;
                }
            }
            None => {
                nodes.insert(graph_node.to_string(), timestamp);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::net::SocketAddr;

    fn peer(port: u16) -> PeerId {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_record_contact_never_moves_backwards() {
        let tracker = NodeStateTracker::new();
        tracker.record_contact(peer(1), "cpu", at(100));
        tracker.record_contact(peer(1), "cpu", at(50));
        assert_eq!(tracker.last_contact_for(&peer(1), "cpu"), Some(at(100)));
        tracker.record_contact(peer(1), "cpu", at(150));
        assert_eq!(tracker.last_contact_for(&peer(1), "cpu"), Some(at(150)));
        assert_eq!(tracker.last_contact_for(&peer(1), "heap"), None);
    }

    #[test]
    fn test_last_contact_across_nodes() {
        let tracker = NodeStateTracker::new();
        tracker.record_contact(peer(1), "cpu", at(100));
        tracker.record_contact(peer(1), "heap", at(300));
        tracker.record_contact(peer(2), "cpu", at(200));
        assert_eq!(tracker.last_contact(&peer(1)), Some(at(300)));
        assert_eq!(tracker.last_contact(&peer(2)), Some(at(200)));
        assert_eq!(tracker.last_contact(&peer(3)), None);
        assert_eq!(tracker.peers(), vec![peer(1), peer(2)]);
    }

    #[test]
    fn test_purge_inactive() {
        let tracker = NodeStateTracker::new();
        tracker.record_contact(peer(1), "cpu", at(100));
        tracker.record_contact(peer(2), "cpu", at(400));
        tracker.record_contact(peer(3), "cpu", at(10));
        tracker.record_contact(peer(3), "heap", at(450));

        let purged = tracker.purge_inactive(at(500), TimeDelta::seconds(200));
        assert_eq!(purged, vec![peer(1)]);
        assert_eq!(tracker.peers(), vec![peer(2), peer(3)]);
    }
}
