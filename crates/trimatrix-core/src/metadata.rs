// crates/trimatrix-core/src/metadata.rs

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MatrixConfig;
use crate::triad::Triad;

/// Process-wide configuration plus derived counts, persisted alongside the
/// triad records and rewritten on every mutating operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixMetadata {
    pub dimensions: u32,
    pub complexity: u32,
    pub consensus_threshold: f64,
    /// Registered validator identifiers. Addition-only.
    pub validators: BTreeSet<String>,
    pub triad_count: u64,
    pub validated_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl MatrixMetadata {
    /// Fresh metadata for an empty matrix under the given config.
    pub fn new(config: MatrixConfig) -> Self {
        Self {
            dimensions: config.dimensions,
            complexity: config.complexity,
            consensus_threshold: config.consensus_threshold,
            validators: BTreeSet::new(),
            triad_count: 0,
            validated_count: 0,
            updated_at: Utc::now(),
        }
    }

    /// The configuration portion of this metadata.
    pub fn config(&self) -> MatrixConfig {
        MatrixConfig {
            dimensions: self.dimensions,
            complexity: self.complexity,
            consensus_threshold: self.consensus_threshold,
        }
    }
}

/// Immutable point-in-time view of the matrix: metadata plus the full triad
/// list, derived on demand from the in-memory map. Not transactionally
/// consistent with concurrent writers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixSnapshot {
    pub metadata: MatrixMetadata,
    pub triads: Vec<Triad>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_roundtrip() {
        let mut meta = MatrixMetadata::new(MatrixConfig::default());
        meta.validators.insert("v1".to_string());
        meta.triad_count = 2;

        let json = serde_json::to_string(&meta).unwrap();
        let back: MatrixMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.triad_count, 2);
        assert!(back.validators.contains("v1"));
        assert_eq!(back.config(), MatrixConfig::default());
    }
}
