//! An in-process swarm transport used for integration tests: peers sharing
//! a [`LoopbackNetwork`] reach each other through in-memory channels
//! instead of real sockets.
//!
//! Grounded in nothing fancier than `dashmap` fan-out, the same
//! concurrent-map crate used elsewhere in this workspace for connection
//! and session tables.

use crate::error::TransportError;
use crate::topic_key::TopicKey;
use crate::transport::{ConnectionId, PeerId, SwarmTransport, TransportEvent};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

enum Envelope {
    Joined { from: PeerId, topic_key: TopicKey },
    Left { from: PeerId, topic_key: TopicKey },
    Data { from: PeerId, topic_key: TopicKey, bytes: Vec<u8> },
}

/// Shared hub connecting every [`LoopbackTransport`] in a test swarm.
pub struct LoopbackNetwork {
    inboxes: DashMap<PeerId, mpsc::UnboundedSender<Envelope>>,
    members: DashMap<TopicKey, DashSet<PeerId>>,
}

impl LoopbackNetwork {
    /// Create an empty network with no registered peers.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inboxes: DashMap::new(),
            members: DashMap::new(),
        })
    }

    fn members_of(&self, topic_key: TopicKey) -> Vec<PeerId> {
        self.members
            .get(&topic_key)
            .map(|set| set.iter().map(|p| *p).collect())
            .unwrap_or_default()
    }
}

/// One peer's handle onto a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    peer_id: PeerId,
    network: Arc<LoopbackNetwork>,
    connections: Arc<DashMap<(TopicKey, PeerId), ConnectionId>>,
    next_conn_id: Arc<AtomicU64>,
    events_tx: broadcast::Sender<TransportEvent>,
}

impl LoopbackTransport {
    /// Register a new peer on `network` and start its event pump.
    #[must_use]
    pub fn new(peer_id: PeerId, network: Arc<LoopbackNetwork>) -> Self {
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel::<Envelope>();
        network.inboxes.insert(peer_id, inbox_tx);

        let (events_tx, _) = broadcast::channel(1024);
        let connections = Arc::new(DashMap::new());
        let next_conn_id = Arc::new(AtomicU64::new(1));

        let pump_events = events_tx.clone();
        let pump_connections = connections.clone();
        let pump_next_id = next_conn_id.clone();
        tokio::spawn(async move {
            while let Some(envelope) = inbox_rx.recv().await {
                match envelope {
                    Envelope::Joined { from, topic_key } => {
                        let conn = ConnectionId(pump_next_id.fetch_add(1, Ordering::Relaxed));
                        pump_connections.insert((topic_key, from), conn);
                        let _ = pump_events.send(TransportEvent::PeerConnected {
                            conn,
                            peer_id: from,
                            topic_key,
                        });
                    }
                    Envelope::Left { from, topic_key } => {
                        pump_connections.remove(&(topic_key, from));
                        let _ = pump_events.send(TransportEvent::PeerDisconnected {
                            peer_id: from,
                            topic_key,
                        });
                    }
                    Envelope::Data { from, topic_key, bytes } => {
                        let conn = *pump_connections
                            .entry((topic_key, from))
                            .or_insert_with(|| ConnectionId(pump_next_id.fetch_add(1, Ordering::Relaxed)));
                        let _ = pump_events.send(TransportEvent::PeerData {
                            conn,
                            peer_id: from,
                            bytes,
                        });
                    }
                }
            }
        });

        Self {
            peer_id,
            network,
            connections,
            next_conn_id,
            events_tx,
        }
    }

    /// This transport's own peer id.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

#[async_trait]
impl SwarmTransport for LoopbackTransport {
    async fn join(&self, _topic_name: &str, topic_key: TopicKey) -> Result<(), TransportError> {
        let existing = self.network.members_of(topic_key);

        self.network
            .members
            .entry(topic_key)
            .or_insert_with(DashSet::new)
            .insert(self.peer_id);

        for peer in existing {
            if peer == self.peer_id {
                continue;
            }
            let conn = ConnectionId(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
            self.connections.insert((topic_key, peer), conn);
            let _ = self.events_tx.send(TransportEvent::PeerConnected {
                conn,
                peer_id: peer,
                topic_key,
            });

            if let Some(inbox) = self.network.inboxes.get(&peer) {
                let _ = inbox.send(Envelope::Joined {
                    from: self.peer_id,
                    topic_key,
                });
            }
        }
        Ok(())
    }

    async fn leave(&self, _topic_name: &str, topic_key: TopicKey) -> Result<(), TransportError> {
        if let Some(set) = self.network.members.get(&topic_key) {
            set.remove(&self.peer_id);
        }

        let removed: Vec<PeerId> = self
            .connections
            .iter()
            .filter(|entry| entry.key().0 == topic_key)
            .map(|entry| entry.key().1)
            .collect();

        for peer in removed {
            self.connections.remove(&(topic_key, peer));
            if let Some(inbox) = self.network.inboxes.get(&peer) {
                let _ = inbox.send(Envelope::Left {
                    from: self.peer_id,
                    topic_key,
                });
            }
        }
        Ok(())
    }

    async fn broadcast(&self, topic_key: TopicKey, bytes: &[u8]) -> Result<usize, TransportError> {
        let members = self.network.members_of(topic_key);
        if !members.contains(&self.peer_id) {
            return Err(TransportError::NotJoined);
        }

        let mut sent = 0usize;
        for peer in members {
            if peer == self.peer_id {
                continue;
            }
            if let Some(inbox) = self.network.inboxes.get(&peer) {
                if inbox
                    .send(Envelope::Data {
                        from: self.peer_id,
                        topic_key,
                        bytes: bytes.to_vec(),
                    })
                    .is_ok()
                {
                    sent += 1;
                }
            }
        }
        Ok(sent)
    }

    async fn unicast(
        &self,
        topic_key: TopicKey,
        peer_id: PeerId,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        let inbox = self
            .network
            .inboxes
            .get(&peer_id)
            .ok_or(TransportError::PeerNotConnected)?;
        inbox
            .send(Envelope::Data {
                from: self.peer_id,
                topic_key,
                bytes: bytes.to_vec(),
            })
            .map_err(|_| TransportError::Closed)
    }

    fn connections(&self, topic_key: TopicKey) -> Vec<(PeerId, ConnectionId)> {
        self.connections
            .iter()
            .filter(|entry| entry.key().0 == topic_key)
            .map(|entry| (entry.key().1, *entry.value()))
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }
}
