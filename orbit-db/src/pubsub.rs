//! Publish/subscribe channel the replicator announces heads on.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use anyhow::Result;
use bytes::Bytes;
use futures_util::{FutureExt, future::BoxFuture};
use orbit_base::PublicKey;
use parking_lot::Mutex;
use tracing::trace;

/// Identifier of a node on the pub/sub network.
pub type PeerId = PublicKey;

/// A message received on a topic.
#[derive(Debug, Clone)]
pub struct Message {
    pub from: PeerId,
    pub content: Bytes,
}

/// A topic based, fire-and-forget message transport.
pub trait PubSub: fmt::Debug + Send + Sync + 'static {
    /// Our own peer id.
    fn peer_id(&self) -> PeerId;

    /// Subscribe to `topic`. Messages published by other peers arrive on the returned channel.
    fn subscribe(&self, topic: &str) -> BoxFuture<'_, Result<flume::Receiver<Message>>>;

    /// Stop receiving messages for `topic`.
    fn unsubscribe(&self, topic: &str) -> BoxFuture<'_, Result<()>>;

    /// Send `content` to every other subscriber of `topic`.
    fn publish(&self, topic: &str, content: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Other peers currently subscribed to `topic`.
    fn peers(&self, topic: &str) -> BoxFuture<'_, Result<Vec<PeerId>>>;
}

type Topics = HashMap<String, BTreeMap<PeerId, flume::Sender<Message>>>;

/// In process pub/sub network. Every [`MemPubSub`] created from one hub sees the others.
#[derive(Debug, Clone, Default)]
pub struct MemHub {
    topics: Arc<Mutex<Topics>>,
}

impl MemHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A node on this hub identified by `peer_id`.
    pub fn node(&self, peer_id: PeerId) -> MemPubSub {
        MemPubSub {
            peer_id,
            hub: self.clone(),
        }
    }
}

/// A node on a [`MemHub`].
#[derive(Debug, Clone)]
pub struct MemPubSub {
    peer_id: PeerId,
    hub: MemHub,
}

impl MemPubSub {
    fn subscribe0(&self, topic: &str) -> flume::Receiver<Message> {
        let (tx, rx) = flume::unbounded();
        self.hub
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .insert(self.peer_id, tx);
        trace!(peer = %self.peer_id, topic, "subscribed");
        rx
    }

    fn unsubscribe0(&self, topic: &str) {
        let mut topics = self.hub.topics.lock();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.remove(&self.peer_id);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }

    fn publish0(&self, topic: &str, content: Bytes) {
        let mut topics = self.hub.topics.lock();
        let Some(subscribers) = topics.get_mut(topic) else {
            return;
        };
        let msg = Message {
            from: self.peer_id,
            content,
        };
        // drop subscribers whose receiver is gone
        subscribers
            .retain(|peer, tx| *peer == self.peer_id || tx.send(msg.clone()).is_ok());
    }

    fn peers0(&self, topic: &str) -> Vec<PeerId> {
        let topics = self.hub.topics.lock();
        topics
            .get(topic)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|(peer, tx)| **peer != self.peer_id && !tx.is_disconnected())
                    .map(|(peer, _)| *peer)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl PubSub for MemPubSub {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn subscribe(&self, topic: &str) -> BoxFuture<'_, Result<flume::Receiver<Message>>> {
        futures_util::future::ready(Ok(self.subscribe0(topic))).boxed()
    }

    fn unsubscribe(&self, topic: &str) -> BoxFuture<'_, Result<()>> {
        self.unsubscribe0(topic);
        futures_util::future::ready(Ok(())).boxed()
    }

    fn publish(&self, topic: &str, content: Bytes) -> BoxFuture<'_, Result<()>> {
        self.publish0(topic, content);
        futures_util::future::ready(Ok(())).boxed()
    }

    fn peers(&self, topic: &str) -> BoxFuture<'_, Result<Vec<PeerId>>> {
        futures_util::future::ready(Ok(self.peers0(topic))).boxed()
    }
}
