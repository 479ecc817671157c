use std::{num::NonZeroUsize, sync::Arc};

use log::{debug, info};
use lru::LruCache;
use model::{scavenge::StreamHandle, stream::is_metastream};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use store::{error::MapError, ScavengeStore};

use crate::hash::LongHasher;

/// Resolves stream ids to the handle their state is stored under.
///
/// A stream is keyed by the hash of its id until a second stream with the same hash is
/// seen. From then on both streams, and any later stream with that hash, are keyed by
/// their full ids. State recorded under the hash before the collision was discovered is
/// moved over to the full id of its owner.
pub struct StreamIdentityResolver {
    store: Arc<ScavengeStore>,
    hasher: Arc<dyn LongHasher>,

    /// Front of the hash -> stream id map.
    hash_users: Mutex<LruCache<u64, String>>,

    /// Hashes shared by more than one stream.
    colliding_hashes: Mutex<FxHashSet<u64>>,

    /// Stream ids already checked in the current pass.
    detected: Mutex<FxHashSet<String>>,
}

impl StreamIdentityResolver {
    pub fn new(
        store: Arc<ScavengeStore>,
        hasher: Arc<dyn LongHasher>,
        cache_capacity: usize,
    ) -> Result<Self, MapError> {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        let resolver = Self {
            store,
            hasher,
            hash_users: Mutex::new(LruCache::new(capacity)),
            colliding_hashes: Mutex::new(FxHashSet::default()),
            detected: Mutex::new(FxHashSet::default()),
        };
        resolver.reload()?;
        Ok(resolver)
    }

    /// Forget everything cached and read the known collisions again.
    ///
    /// Required after a rollback: cached entries may describe writes that never committed.
    pub fn reload(&self) -> Result<(), MapError> {
        self.hash_users.lock().clear();
        self.detected.lock().clear();
        let hashes: FxHashSet<u64> = self
            .store
            .collisions
            .all_records()?
            .into_iter()
            .map(|(stream_id, _)| self.hasher.hash(&stream_id))
            .collect();
        debug!("Loaded {} colliding hashes", hashes.len());
        *self.colliding_hashes.lock() = hashes;
        Ok(())
    }

    /// Start a new pass: every stream id gets checked again.
    pub fn start_pass(&self) {
        self.detected.lock().clear();
    }

    pub fn hash(&self, stream_id: &str) -> u64 {
        self.hasher.hash(stream_id)
    }

    /// Handle of `stream_id` given the collisions detected so far.
    pub fn handle_of(&self, stream_id: &str) -> StreamHandle {
        let hash = self.hasher.hash(stream_id);
        if self.colliding_hashes.lock().contains(&hash) {
            StreamHandle::Exact(stream_id.to_owned())
        } else {
            StreamHandle::Hash(hash)
        }
    }

    /// Detect whether `stream_id` collides with another stream, then return its handle.
    ///
    /// Must run inside a transaction so that the detection commits together with the
    /// state it affects.
    pub fn resolve(&self, stream_id: &str) -> Result<StreamHandle, MapError> {
        self.detect_collisions(stream_id)?;
        Ok(self.handle_of(stream_id))
    }

    pub fn detect_collisions(&self, stream_id: &str) -> Result<(), MapError> {
        if self.detected.lock().contains(stream_id) {
            return Ok(());
        }

        let hash = self.hasher.hash(stream_id);
        if self.colliding_hashes.lock().contains(&hash) {
            // The hash is known to collide. This id might not be recorded yet.
            self.store.collisions.set(&stream_id.to_owned(), &model::scavenge::Unit)?;
        } else {
            match self.hash_user(hash)? {
                None => {
                    self.store.hashes.set(&hash, &stream_id.to_owned())?;
                    self.hash_users.lock().put(hash, stream_id.to_owned());
                }
                Some(user) if user == stream_id => {}
                Some(user) => self.on_collision(hash, &user, stream_id)?,
            }
        }

        self.detected.lock().insert(stream_id.to_owned());
        Ok(())
    }

    fn hash_user(&self, hash: u64) -> Result<Option<String>, MapError> {
        if let Some(user) = self.hash_users.lock().get(&hash) {
            return Ok(Some(user.clone()));
        }
        let user = self.store.hashes.try_get(&hash)?;
        if let Some(ref user) = user {
            self.hash_users.lock().put(hash, user.clone());
        }
        Ok(user)
    }

    fn on_collision(&self, hash: u64, previous: &str, stream_id: &str) -> Result<(), MapError> {
        info!(
            "Detected hash collision {:#018x} between stream {} and {}",
            hash, previous, stream_id
        );
        self.store.collisions.set(&previous.to_owned(), &model::scavenge::Unit)?;
        self.store.collisions.set(&stream_id.to_owned(), &model::scavenge::Unit)?;
        self.colliding_hashes.lock().insert(hash);

        // Only the previous user can own state stored under the hash.
        if is_metastream(previous) {
            if let Some(data) = self.store.metastreams.try_remove(&hash)? {
                self.store
                    .metastream_collisions
                    .set(&previous.to_owned(), &data)?;
            }
        } else if let Some(data) = self.store.original_streams.try_remove(&hash)? {
            self.store
                .original_stream_collisions
                .set(&previous.to_owned(), &data)?;
        }
        Ok(())
    }

    /// Stream id behind a handle. Hashes resolve through the hash -> stream id map.
    pub fn stream_id_of(&self, handle: &StreamHandle) -> Result<Option<String>, MapError> {
        match handle {
            StreamHandle::Hash(hash) => self.hash_user(*hash),
            StreamHandle::Exact(stream_id) => Ok(Some(stream_id.clone())),
        }
    }

    /// All stream ids known to collide.
    pub fn collisions(&self) -> Result<Vec<String>, MapError> {
        Ok(self
            .store
            .collisions
            .all_records()?
            .into_iter()
            .map(|(stream_id, _)| stream_id)
            .collect())
    }
}
