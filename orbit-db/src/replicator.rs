//! Exchanges heads with other peers of a database over pub/sub.
//!
//! Every open database with `sync` enabled runs one replicator actor. The actor subscribes to
//! the topic named by the database address, publishes the local heads whenever they change or
//! a new peer shows up, and merges the heads announced by others.

use std::{
    collections::BTreeSet,
    num::NonZeroUsize,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use lru::LruCache;
use orbit_base::Hash;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinSet,
};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{Instrument, debug, error_span, trace, warn};

use crate::{
    address::Address,
    config::Config,
    database::Event,
    pubsub::{Message, PeerId, PubSub},
};

const TO_ACTOR_CAP: usize = 64;

/// Heads of a database and its access log, as published on the topic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub heads: Vec<Hash>,
    pub access_heads: Vec<Hash>,
}

impl Announcement {
    pub fn is_empty(&self) -> bool {
        self.heads.is_empty() && self.access_heads.is_empty()
    }

    fn all(&self) -> impl Iterator<Item = &Hash> {
        self.heads.iter().chain(self.access_heads.iter())
    }

    fn encode(&self) -> Result<Bytes> {
        Ok(postcard::to_stdvec(self)?.into())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Where a replicator is in catching up with its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum ReplicationState {
    /// Not replicating.
    #[default]
    Idle,
    /// Subscribed, nothing received yet.
    AwaitingPeers,
    /// Merging announced heads.
    Syncing,
    /// Every announcement received so far is merged.
    Converged,
}

/// The database side of replication.
pub(crate) trait Replica: Send + Sync + 'static {
    /// Current local heads.
    fn announcement(&self) -> Announcement;

    /// Whether every announced head is already present.
    fn knows(&self, announcement: &Announcement) -> bool;

    /// Merge announced heads, returning the number of new entries.
    fn merge(
        &self,
        announcement: Announcement,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<usize>>;

    fn notify(&self, event: Event);
}

#[derive(Debug)]
enum ToActor {
    /// Local heads changed.
    Announce,
    Shutdown { reply: oneshot::Sender<()> },
}

/// Handle to a running replicator. Dropping it aborts the actor.
#[derive(Debug)]
pub(crate) struct ReplicatorHandle {
    to_actor_tx: mpsc::Sender<ToActor>,
    _task: AbortOnDropHandle<()>,
}

impl ReplicatorHandle {
    pub(crate) fn spawn(
        replica: Weak<dyn Replica>,
        address: &Address,
        pubsub: Arc<dyn PubSub>,
        config: &Config,
        state_tx: watch::Sender<ReplicationState>,
        cancel: CancellationToken,
    ) -> Self {
        let (to_actor_tx, to_actor_rx) = mpsc::channel(TO_ACTOR_CAP);
        let capacity = NonZeroUsize::new(config.seen_capacity).unwrap_or(NonZeroUsize::MIN);
        let me = pubsub.peer_id().fmt_short();
        let db = address.fmt_short();
        let actor = Actor {
            topic: address.to_string(),
            replica,
            pubsub,
            to_actor_rx,
            state_tx,
            cancel,
            seen: LruCache::new(capacity),
            seen_ttl: config.seen_ttl(),
            poll_interval: config.peer_poll_interval(),
            peers: BTreeSet::new(),
            senders: BTreeSet::new(),
            merges: JoinSet::new(),
        };
        let task = tokio::spawn(
            async move {
                if let Err(err) = actor.run().await {
                    warn!("replicator closed with error: {err:?}");
                }
            }
            .instrument(error_span!("replicator", %db, %me)),
        );
        ReplicatorHandle {
            to_actor_tx,
            _task: AbortOnDropHandle::new(task),
        }
    }

    /// Publish the local heads. Never waits: a full inbox already holds an announce request.
    pub(crate) fn announce(&self) {
        self.to_actor_tx.try_send(ToActor::Announce).ok();
    }

    /// Unsubscribe and stop the actor.
    pub(crate) async fn shutdown(self) {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .to_actor_tx
            .send(ToActor::Shutdown { reply })
            .await
            .is_ok()
        {
            reply_rx.await.ok();
        }
    }
}

struct Actor {
    topic: String,
    replica: Weak<dyn Replica>,
    pubsub: Arc<dyn PubSub>,
    to_actor_rx: mpsc::Receiver<ToActor>,
    state_tx: watch::Sender<ReplicationState>,
    cancel: CancellationToken,
    /// Announced heads with a merge in flight, oldest evicted first.
    seen: LruCache<Hash, Instant>,
    seen_ttl: Duration,
    poll_interval: Duration,
    /// Peers subscribed at the last poll.
    peers: BTreeSet<PeerId>,
    /// Peers we received a message from.
    senders: BTreeSet<PeerId>,
    merges: JoinSet<(Vec<Hash>, Result<usize>)>,
}

impl Actor {
    async fn run(mut self) -> Result<()> {
        let messages = self
            .pubsub
            .subscribe(&self.topic)
            .await
            .context("failed to subscribe")?;
        self.set_state(ReplicationState::AwaitingPeers);
        debug!(topic = %self.topic, "subscribed");

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut reply = None;
        loop {
            tokio::select! {
                biased;
                msg = self.to_actor_rx.recv() => {
                    trace!(?msg, "tick: to_actor");
                    match msg {
                        Some(ToActor::Announce) => self.publish_heads().await,
                        Some(ToActor::Shutdown { reply: r }) => {
                            reply = Some(r);
                            break;
                        }
                        None => break,
                    }
                }
                msg = messages.recv_async() => {
                    let Ok(msg) = msg else {
                        break;
                    };
                    trace!(from = %msg.from.fmt_short(), "tick: message");
                    if let Err(err) = self.on_message(msg) {
                        debug!("ignoring announcement: {err:#}");
                    }
                }
                Some(res) = self.merges.join_next(), if !self.merges.is_empty() => {
                    trace!("tick: merge done");
                    self.on_merged(res);
                }
                _ = poll.tick() => {
                    self.poll_peers().await;
                }
            }
        }

        self.cancel.cancel();
        self.merges.shutdown().await;
        if let Err(err) = self.pubsub.unsubscribe(&self.topic).await {
            debug!("failed to unsubscribe: {err:#}");
        }
        self.set_state(ReplicationState::Idle);
        if let Some(reply) = reply {
            reply.send(()).ok();
        }
        debug!("replicator stopped");
        Ok(())
    }

    fn replica(&self) -> Result<Arc<dyn Replica>> {
        self.replica.upgrade().ok_or_else(|| anyhow!("database dropped"))
    }

    fn set_state(&self, state: ReplicationState) {
        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    async fn publish_heads(&mut self) {
        let Ok(replica) = self.replica() else {
            return;
        };
        let announcement = replica.announcement();
        if announcement.is_empty() {
            return;
        }
        let res = async {
            let content = announcement.encode()?;
            self.pubsub.publish(&self.topic, content).await
        }
        .await;
        match res {
            Ok(()) => trace!(heads = announcement.heads.len(), "published heads"),
            Err(err) => warn!("failed to publish heads: {err:#}"),
        }
    }

    /// Republish heads if a peer joined since the last poll.
    async fn poll_peers(&mut self) {
        let peers: BTreeSet<PeerId> = match self.pubsub.peers(&self.topic).await {
            Ok(peers) => peers.into_iter().collect(),
            Err(err) => {
                debug!("failed to list peers: {err:#}");
                return;
            }
        };
        let joined = peers.difference(&self.peers).count();
        self.peers = peers;
        if joined > 0 {
            debug!(joined, "new peers on topic");
            self.publish_heads().await;
        }
    }

    fn on_message(&mut self, msg: Message) -> Result<()> {
        let replica = self.replica()?;
        if self.senders.insert(msg.from) {
            replica.notify(Event::Peer { peer: msg.from });
        }
        let announcement = Announcement::decode(&msg.content)?;
        if replica.knows(&announcement) {
            trace!("announcement already known");
            if self.merges.is_empty() {
                self.set_state(ReplicationState::Converged);
            }
            return Ok(());
        }
        let now = Instant::now();
        let in_flight = announcement.all().all(|hash| {
            self.seen
                .get(hash)
                .is_some_and(|at| now.duration_since(*at) <= self.seen_ttl)
        });
        if in_flight {
            trace!("announcement already being merged");
            return Ok(());
        }
        let hashes: Vec<Hash> = announcement.all().copied().collect();
        for hash in &hashes {
            self.seen.put(*hash, now);
        }
        self.set_state(ReplicationState::Syncing);
        let cancel = self.cancel.child_token();
        self.merges.spawn(async move {
            let res = replica.merge(announcement, cancel).await;
            (hashes, res)
        });
        Ok(())
    }

    fn on_merged(&mut self, res: Result<(Vec<Hash>, Result<usize>), tokio::task::JoinError>) {
        match res {
            Ok((hashes, res)) => {
                // heads left unresolved are merged again on the next announcement
                for hash in &hashes {
                    self.seen.pop(hash);
                }
                match res {
                    Ok(0) => {}
                    Ok(count) => {
                        debug!(count, "replicated");
                        if let Ok(replica) = self.replica() {
                            replica.notify(Event::Replicated { count });
                        }
                    }
                    Err(err) => warn!("merge failed: {err:#}"),
                }
            }
            Err(err) => warn!("merge task failed: {err}"),
        }
        if self.merges.is_empty() {
            self.set_state(ReplicationState::Converged);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::FutureExt;
    use orbit_base::Identity;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::{
        address::{Manifest, StoreType},
        pubsub::MemHub,
    };

    const TIMEOUT: Duration = Duration::from_secs(10);

    /// Knows nothing and finishes a merge only when a permit is released.
    struct Blocked {
        started: AtomicUsize,
        release: Semaphore,
    }

    impl Replica for Blocked {
        fn announcement(&self) -> Announcement {
            Announcement::default()
        }

        fn knows(&self, _announcement: &Announcement) -> bool {
            false
        }

        fn merge(
            &self,
            _announcement: Announcement,
            _cancel: CancellationToken,
        ) -> BoxFuture<'_, Result<usize>> {
            self.started.fetch_add(1, Ordering::SeqCst);
            async move {
                self.release.acquire().await?.forget();
                anyhow::Ok(0)
            }
            .boxed()
        }

        fn notify(&self, _event: Event) {}
    }

    #[tokio::test]
    async fn unresolved_heads_are_merged_again() -> Result<()> {
        let _guard = orbit_test::logging::setup();
        let hub = MemHub::new();
        let mut rng = orbit_test::test_rng(b"replicator");
        let local = hub.node(Identity::new(&mut rng).public_key());
        let remote = hub.node(Identity::new(&mut rng).public_key());
        let address = Manifest::new("blocked", StoreType::EventLog, Hash::new(b"acl")).address();
        let topic = address.to_string();

        let replica = Arc::new(Blocked {
            started: AtomicUsize::new(0),
            release: Semaphore::new(0),
        });
        let weak: Weak<Blocked> = Arc::downgrade(&replica);
        let (state_tx, state) = watch::channel(ReplicationState::Idle);
        let _handle = ReplicatorHandle::spawn(
            weak,
            &address,
            Arc::new(local.clone()),
            &Config::default(),
            state_tx,
            CancellationToken::new(),
        );
        let me = local.peer_id();
        let (remote, topic, replica) = (&remote, &topic, &replica);
        orbit_test::wait_for(TIMEOUT, || async move {
            remote
                .peers(topic)
                .await
                .is_ok_and(|peers| peers.contains(&me))
        })
        .await?;

        let announcement = Announcement {
            heads: vec![Hash::new(b"head")],
            access_heads: vec![],
        };
        let content = announcement.encode()?;

        // repeats of a head being merged are dropped
        remote.publish(topic, content.clone()).await?;
        orbit_test::wait_for(TIMEOUT, || async move {
            replica.started.load(Ordering::SeqCst) == 1
        })
        .await?;
        remote.publish(topic, content.clone()).await?;
        remote.publish(topic, content.clone()).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(replica.started.load(Ordering::SeqCst), 1);
        assert_eq!(*state.borrow(), ReplicationState::Syncing);

        // the merge left the head unknown, so announcing it again retries
        replica.release.add_permits(1);
        orbit_test::wait_for(TIMEOUT, || {
            let content = content.clone();
            async move {
                remote.publish(topic, content).await.ok();
                replica.started.load(Ordering::SeqCst) >= 2
            }
        })
        .await?;
        replica.release.add_permits(8);
        Ok(())
    }

    #[test]
    fn announcement_wire() {
        let announcement = Announcement {
            heads: vec![Hash::new(b"a"), Hash::new(b"b")],
            access_heads: vec![Hash::new(b"c")],
        };
        let bytes = announcement.encode().unwrap();
        assert_eq!(Announcement::decode(&bytes).unwrap(), announcement);
        assert!(Announcement::decode(b"\xff").is_err());
        assert!(Announcement::default().is_empty());
    }
}
