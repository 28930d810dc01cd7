use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use {
    crypto_box::{PublicKey, SecretKey},
    dashmap::{DashMap, mapref::entry::Entry},
    tracing::debug,
};

use crate::channel::Channel;

struct CachedChannel {
    channel: Arc<Channel>,
    last_used: Instant,
}

/// Peer public key → negotiated [`Channel`], bounded by capacity and idle TTL.
///
/// Lookups for the same new key race through the map's entry API, so exactly
/// one channel is created per key; different keys only contend when they
/// hash to the same shard.
pub struct ChannelCache {
    secret: SecretKey,
    channels: DashMap<[u8; 32], CachedChannel>,
    capacity: usize,
    ttl: Option<Duration>,
}

impl ChannelCache {
    pub fn new(secret: SecretKey, capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            secret,
            channels: DashMap::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Return the cached channel for `peer`, performing key agreement on first contact.
    pub fn get_or_create(&self, peer: &PublicKey) -> Arc<Channel> {
        let key = *peer.as_bytes();
        let now = Instant::now();

        let (channel, created) = match self.channels.entry(key) {
            Entry::Occupied(mut occupied) => {
                let cached = occupied.get_mut();
                cached.last_used = now;
                (Arc::clone(&cached.channel), false)
            },
            Entry::Vacant(vacant) => {
                let channel = Arc::new(Channel::new(&self.secret, peer.clone()));
                vacant.insert(CachedChannel {
                    channel: Arc::clone(&channel),
                    last_used: now,
                });
                (channel, true)
            },
        };

        if created {
            debug!(peer = %channel.peer_hex(), cached = self.channels.len(), "created channel");
            self.evict(now, &key);
        }
        channel
    }

    pub fn contains(&self, peer: &PublicKey) -> bool {
        self.channels.contains_key(peer.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Drop idle entries, then least-recently-used ones above capacity. `keep` is never evicted.
    fn evict(&self, now: Instant, keep: &[u8; 32]) {
        if let Some(ttl) = self.ttl {
            self.channels
                .retain(|k, v| k == keep || now.duration_since(v.last_used) < ttl);
        }

        while self.channels.len() > self.capacity {
            let oldest = self
                .channels
                .iter()
                .filter(|e| e.key() != keep)
                .min_by_key(|e| e.value().last_used)
                .map(|e| *e.key());
            let Some(oldest) = oldest else {
                break;
            };
            self.channels.remove(&oldest);
            debug!(peer = %hex::encode(oldest), "evicted channel");
        }
    }
}
