// crates/trimatrix-store/src/rocks.rs
//
// RocksDB wrapper for the Trimatrix node.
//
// Key format:
//   - `triad:{uuid}`            -> JSON-serialized Triad
//   - `matrix:state_metadata`   -> JSON-serialized MatrixMetadata
//
// Triad records and the metadata record are written together in a single
// WriteBatch so counts never drift from the stored records.

use rocksdb::{DBWithThreadMode, MultiThreaded, Options, WriteBatch};
use uuid::Uuid;

use trimatrix_core::{MatrixError, MatrixMetadata, Triad};

/// Prefix under which triad records are stored.
pub const TRIAD_PREFIX: &str = "triad:";

/// Key of the singleton metadata record.
pub const METADATA_KEY: &str = "matrix:state_metadata";

/// RocksDB handle with the key layout used by [`crate::MatrixStore`].
#[derive(Debug)]
pub struct MatrixDb {
    db: DBWithThreadMode<MultiThreaded>,
}

impl MatrixDb {
    /// Open a RocksDB database at the given filesystem path.
    ///
    /// Creates the database directory if it does not exist.
    pub fn open(path: &str) -> Result<Self, MatrixError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DBWithThreadMode::<MultiThreaded>::open(&opts, path)
            .map_err(|e| MatrixError::Storage(format!("Failed to open RocksDB at {}: {}", path, e)))?;

        Ok(Self { db })
    }

    /// Build the primary key for a triad: `triad:{uuid}`.
    fn triad_key(id: &Uuid) -> Vec<u8> {
        format!("{}{}", TRIAD_PREFIX, id).into_bytes()
    }

    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MatrixError> {
        self.db
            .get(key)
            .map_err(|e| MatrixError::Storage(format!("RocksDB get failed: {}", e)))
    }

    /// Load a triad record by id.
    pub fn get_triad(&self, id: &Uuid) -> Result<Option<Triad>, MatrixError> {
        match self.get_raw(&Self::triad_key(id))? {
            Some(bytes) => {
                let triad: Triad = serde_json::from_slice(&bytes)?;
                Ok(Some(triad))
            }
            None => Ok(None),
        }
    }

    /// Load the metadata record, if one has been written.
    pub fn get_metadata(&self) -> Result<Option<MatrixMetadata>, MatrixError> {
        match self.get_raw(METADATA_KEY.as_bytes())? {
            Some(bytes) => {
                let meta: MatrixMetadata = serde_json::from_slice(&bytes)?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    /// Write the metadata record alone (validator additions).
    pub fn put_metadata(&self, metadata: &MatrixMetadata) -> Result<(), MatrixError> {
        let bytes = serde_json::to_vec(metadata)?;
        self.db
            .put(METADATA_KEY.as_bytes(), &bytes)
            .map_err(|e| MatrixError::Storage(format!("RocksDB put failed: {}", e)))
    }

    /// Write a triad record and the metadata record as one atomic batch.
    pub fn put_triad_with_metadata(
        &self,
        triad: &Triad,
        metadata: &MatrixMetadata,
    ) -> Result<(), MatrixError> {
        let triad_bytes = serde_json::to_vec(triad)?;
        let meta_bytes = serde_json::to_vec(metadata)?;

        let mut batch = WriteBatch::default();
        batch.put(Self::triad_key(&triad.id), &triad_bytes);
        batch.put(METADATA_KEY.as_bytes(), &meta_bytes);

        self.db
            .write(batch)
            .map_err(|e| MatrixError::Storage(format!("RocksDB batch write failed: {}", e)))
    }

    /// Full prefix scan over the triad keyspace, used once at startup to
    /// rebuild the in-memory mirror.
    pub fn scan_triads(&self) -> Result<Vec<Triad>, MatrixError> {
        let prefix = TRIAD_PREFIX.as_bytes();
        let mut triads = Vec::new();

        let iter = self.db.prefix_iterator(prefix);
        for item in iter {
            let (key, value) =
                item.map_err(|e| MatrixError::Storage(format!("RocksDB iteration error: {}", e)))?;

            // Keys are `triad:{uuid}`. Stop when the prefix no longer matches.
            if !key.starts_with(prefix) {
                break;
            }

            let triad: Triad = serde_json::from_slice(&value)?;
            triads.push(triad);
        }

        Ok(triads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trimatrix_core::MatrixConfig;

    fn temp_db_path(label: &str) -> String {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("trimatrix_test_{}_{}", label, Uuid::new_v4()));
        path.to_string_lossy().to_string()
    }

    #[test]
    fn test_triad_roundtrip_with_metadata_batch() {
        let db = MatrixDb::open(&temp_db_path("rocks_roundtrip")).unwrap();
        let triad = Triad::new(json!({"k": 1}), "c1".to_string(), 3);
        let mut meta = MatrixMetadata::new(MatrixConfig::default());
        meta.triad_count = 1;

        db.put_triad_with_metadata(&triad, &meta).unwrap();

        let loaded = db.get_triad(&triad.id).unwrap().unwrap();
        assert_eq!(loaded.id, triad.id);
        assert_eq!(loaded.creator, "c1");

        let loaded_meta = db.get_metadata().unwrap().unwrap();
        assert_eq!(loaded_meta.triad_count, 1);
    }

    #[test]
    fn test_scan_returns_all_triads() {
        let db = MatrixDb::open(&temp_db_path("rocks_scan")).unwrap();
        let meta = MatrixMetadata::new(MatrixConfig::default());

        for i in 0..5 {
            let triad = Triad::new(json!({"i": i}), "c1".to_string(), 3);
            db.put_triad_with_metadata(&triad, &meta).unwrap();
        }

        let triads = db.scan_triads().unwrap();
        assert_eq!(triads.len(), 5);
    }

    #[test]
    fn test_missing_records_are_none() {
        let db = MatrixDb::open(&temp_db_path("rocks_missing")).unwrap();
        assert!(db.get_triad(&Uuid::new_v4()).unwrap().is_none());
        assert!(db.get_metadata().unwrap().is_none());
    }
}
