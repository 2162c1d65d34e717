// crates/trimatrix-store/src/matrix.rs
//
// MatrixStore: the spatial triad store.
//
// Owns triad and metadata persistence. The RocksDB record set is the source
// of truth; a single in-memory map mirrors it for point lookups and neighbor
// search, and list/count views are derived from that map on demand. Every
// mutation writes through to RocksDB before it is acknowledged or mirrored.
//
// Validation of a given triad id is serialized by a per-id async mutex held
// across the whole read-score-write sequence, so concurrent validators can
// neither under-count attempts nor clobber a threshold-crossing write.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use trimatrix_consensus::{score_triad, spatial_neighbors};
use trimatrix_core::{
    validate_identity, validate_triad_data, MatrixConfig, MatrixError, MatrixEvent, MatrixMetadata,
    MatrixSnapshot, Triad, TriadStore,
};

use crate::rocks::MatrixDb;

/// Mirror of the persisted state, rebuilt once at startup.
struct MatrixInner {
    metadata: MatrixMetadata,
    triads: HashMap<Uuid, Triad>,
}

/// RocksDB-backed spatial triad store.
pub struct MatrixStore {
    db: MatrixDb,
    /// `None` until [`MatrixStore::initialize`] completes.
    inner: RwLock<Option<MatrixInner>>,
    /// Per-triad-id validation locks, created on demand.
    validation_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    /// Event subscription; absent until the first `subscribe` call.
    events: std::sync::Mutex<Option<mpsc::Sender<MatrixEvent>>>,
    /// Config to seed metadata with when the store is empty.
    seed_config: MatrixConfig,
}

impl MatrixStore {
    /// Open the underlying database without loading state.
    ///
    /// All operations fail with `NotInitialized` until
    /// [`MatrixStore::initialize`] has run. `config` seeds the metadata
    /// record only when none is persisted yet; out-of-range fields fall
    /// back to their defaults.
    pub fn open(path: &str, config: MatrixConfig) -> Result<Self, MatrixError> {
        let (config, replaced) = config.sanitized();
        for field in replaced {
            tracing::warn!("Invalid matrix config value for {}, using default", field);
        }

        Ok(Self {
            db: MatrixDb::open(path)?,
            inner: RwLock::new(None),
            validation_locks: Mutex::new(HashMap::new()),
            events: std::sync::Mutex::new(None),
            seed_config: config,
        })
    }

    /// Load the metadata record and rebuild the triad mirror with a full
    /// prefix scan. Runs once; a second call is a no-op.
    pub async fn initialize(&self) -> Result<(), MatrixError> {
        let mut guard = self.inner.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let metadata = match self.db.get_metadata()? {
            Some(meta) => meta,
            None => {
                let meta = MatrixMetadata::new(self.seed_config);
                self.db.put_metadata(&meta)?;
                meta
            }
        };

        let triads: HashMap<Uuid, Triad> = self
            .db
            .scan_triads()?
            .into_iter()
            .map(|t| (t.id, t))
            .collect();

        tracing::info!(
            triads = triads.len(),
            validators = metadata.validators.len(),
            "Matrix store initialized"
        );

        *guard = Some(MatrixInner { metadata, triads });
        Ok(())
    }

    /// Subscribe to store events through a bounded channel.
    ///
    /// A single consumer is supported; subscribing again replaces the
    /// previous channel. Emission never blocks a mutation: events are
    /// dropped with a warning when the channel is full.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<MatrixEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        let mut guard = self.events.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(tx);
        rx
    }

    fn emit(&self, event: MatrixEvent) {
        let mut guard = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            match tx.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(ev)) => {
                    tracing::warn!(?ev, "Event channel full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    *guard = None;
                }
            }
        }
    }

    async fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.validation_locks.lock().await;
        locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Remove the per-id lock entry when no other task holds a clone.
    ///
    /// Two strong refs mean the map entry plus the caller's own clone; any
    /// concurrent waiter would hold a third, so the check under the map
    /// mutex is race-free.
    async fn discard_unused_lock(&self, id: Uuid, lock: &Arc<Mutex<()>>) {
        let mut locks = self.validation_locks.lock().await;
        if Arc::strong_count(lock) == 2 {
            locks.remove(&id);
        }
    }

    /// The read-score-write sequence of `validate_triad`. Caller holds the
    /// per-id lock.
    async fn validate_triad_locked(&self, id: Uuid, validator: &str) -> Result<Triad, MatrixError> {
        let (mut triad, registered, score, threshold) = {
            let guard = self.inner.read().await;
            let inner = guard.as_ref().ok_or(MatrixError::NotInitialized)?;

            let triad = inner
                .triads
                .get(&id)
                .cloned()
                .ok_or_else(|| MatrixError::NotFound(format!("triad {}", id)))?;

            // Already validated: no-op, attempts and score untouched.
            if triad.validated {
                return Ok(triad);
            }

            let registered = inner.metadata.validators.contains(validator);
            let neighbors =
                spatial_neighbors(&triad, inner.triads.values(), inner.metadata.complexity);
            let score = score_triad(&triad, &neighbors, registered, inner.metadata.complexity);
            (triad, registered, score, inner.metadata.consensus_threshold)
        };

        triad.validation_attempts += 1;
        triad.consensus = score;
        let crossed = score >= threshold;
        if crossed {
            triad.validated = true;
        }

        if !registered {
            tracing::debug!(id = %id, validator, "Unregistered validator, base term zero");
        }

        let mut guard = self.inner.write().await;
        let inner = guard.as_mut().ok_or(MatrixError::NotInitialized)?;

        let mut metadata = inner.metadata.clone();
        if crossed {
            metadata.validated_count += 1;
        }
        metadata.updated_at = Utc::now();

        self.db.put_triad_with_metadata(&triad, &metadata)?;
        inner.metadata = metadata;
        inner.triads.insert(triad.id, triad.clone());
        drop(guard);

        tracing::debug!(
            id = %id,
            validator,
            consensus = triad.consensus,
            validated = triad.validated,
            "Validation evaluated"
        );
        self.emit(MatrixEvent::TriadValidated(triad.clone()));
        Ok(triad)
    }
}

#[async_trait]
impl TriadStore for MatrixStore {
    async fn create_triad(&self, data: Value, creator: &str) -> Result<Triad, MatrixError> {
        validate_triad_data(&data)?;
        validate_identity(creator, "creator")?;

        let mut guard = self.inner.write().await;
        let inner = guard.as_mut().ok_or(MatrixError::NotInitialized)?;

        let triad = Triad::new(data, creator.to_string(), inner.metadata.dimensions);

        let mut metadata = inner.metadata.clone();
        metadata.triad_count += 1;
        metadata.updated_at = Utc::now();

        // Write through before touching the mirror.
        self.db.put_triad_with_metadata(&triad, &metadata)?;
        inner.metadata = metadata;
        inner.triads.insert(triad.id, triad.clone());
        drop(guard);

        tracing::debug!(id = %triad.id, creator, "Triad created");
        self.emit(MatrixEvent::TriadCreated(triad.clone()));
        Ok(triad)
    }

    async fn validate_triad(&self, id: Uuid, validator: &str) -> Result<Triad, MatrixError> {
        validate_identity(validator, "validator")?;

        // Serialize the read-score-write sequence per triad id.
        let lock = self.lock_for(id).await;
        let outcome = {
            let _serial = lock.lock().await;
            self.validate_triad_locked(id, validator).await
        };
        if outcome.is_err() {
            // Entries created for unknown ids are dropped again so caller
            // input cannot grow the lock map without bound.
            self.discard_unused_lock(id, &lock).await;
        }
        outcome
    }

    async fn get_triad(&self, id: Uuid) -> Result<Triad, MatrixError> {
        let guard = self.inner.read().await;
        let inner = guard.as_ref().ok_or(MatrixError::NotInitialized)?;
        inner
            .triads
            .get(&id)
            .cloned()
            .ok_or_else(|| MatrixError::NotFound(format!("triad {}", id)))
    }

    async fn metadata(&self) -> Result<MatrixMetadata, MatrixError> {
        let guard = self.inner.read().await;
        let inner = guard.as_ref().ok_or(MatrixError::NotInitialized)?;
        Ok(inner.metadata.clone())
    }

    async fn matrix_state(&self) -> Result<MatrixSnapshot, MatrixError> {
        let guard = self.inner.read().await;
        let inner = guard.as_ref().ok_or(MatrixError::NotInitialized)?;
        Ok(MatrixSnapshot {
            metadata: inner.metadata.clone(),
            triads: inner.triads.values().cloned().collect(),
        })
    }

    async fn add_validator(&self, id: &str) -> Result<bool, MatrixError> {
        validate_identity(id, "validator")?;

        let mut guard = self.inner.write().await;
        let inner = guard.as_mut().ok_or(MatrixError::NotInitialized)?;

        if inner.metadata.validators.contains(id) {
            return Ok(false);
        }

        let mut metadata = inner.metadata.clone();
        metadata.validators.insert(id.to_string());
        metadata.updated_at = Utc::now();

        self.db.put_metadata(&metadata)?;
        inner.metadata = metadata;

        tracing::info!(validator = id, "Validator registered");
        Ok(true)
    }

    async fn apply_remote_triad(&self, triad: Triad) -> Result<bool, MatrixError> {
        let mut guard = self.inner.write().await;
        let inner = guard.as_mut().ok_or(MatrixError::NotInitialized)?;

        // Local write wins: an existing record is never overwritten.
        if inner.triads.contains_key(&triad.id) {
            return Ok(false);
        }

        let mut metadata = inner.metadata.clone();
        metadata.triad_count += 1;
        if triad.validated {
            metadata.validated_count += 1;
        }
        metadata.updated_at = Utc::now();

        self.db.put_triad_with_metadata(&triad, &metadata)?;
        inner.metadata = metadata;
        inner.triads.insert(triad.id, triad);
        Ok(true)
    }

    async fn apply_remote_validation(&self, remote: Triad) -> Result<bool, MatrixError> {
        // Take the same per-id lock as local validation so a remote apply
        // cannot interleave with a local read-score-write.
        let lock = self.lock_for(remote.id).await;
        let _serial = lock.lock().await;

        let mut guard = self.inner.write().await;
        let inner = guard.as_mut().ok_or(MatrixError::NotInitialized)?;

        let Some(local) = inner.triads.get(&remote.id).cloned() else {
            // Unknown id: treat the validation outcome as an insertion.
            let mut metadata = inner.metadata.clone();
            metadata.triad_count += 1;
            if remote.validated {
                metadata.validated_count += 1;
            }
            metadata.updated_at = Utc::now();

            self.db.put_triad_with_metadata(&remote, &metadata)?;
            inner.metadata = metadata;
            inner.triads.insert(remote.id, remote);
            return Ok(true);
        };

        // `validated` is monotonic: a validated local record is final.
        if local.validated {
            return Ok(false);
        }

        let mut merged = local.clone();
        merged.consensus = remote.consensus;
        merged.validation_attempts = remote.validation_attempts;
        merged.validated = remote.validated;

        if merged.validated == local.validated
            && merged.consensus == local.consensus
            && merged.validation_attempts == local.validation_attempts
        {
            return Ok(false);
        }

        let mut metadata = inner.metadata.clone();
        if merged.validated {
            metadata.validated_count += 1;
        }
        metadata.updated_at = Utc::now();

        self.db.put_triad_with_metadata(&merged, &metadata)?;
        inner.metadata = metadata;
        inner.triads.insert(merged.id, merged);
        Ok(true)
    }
}
