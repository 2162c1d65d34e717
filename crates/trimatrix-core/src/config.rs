// crates/trimatrix-core/src/config.rs
//
// Matrix configuration parameters with validated fallback to defaults.

use serde::{Deserialize, Serialize};

pub const DEFAULT_DIMENSIONS: u32 = 3;
pub const DEFAULT_COMPLEXITY: u32 = 4;
pub const DEFAULT_CONSENSUS_THRESHOLD: f64 = 0.67;
pub const DEFAULT_MAX_PEERS: usize = 10;

/// Process-wide matrix configuration.
///
/// Invalid values do not fail startup; [`MatrixConfig::sanitized`] replaces
/// each out-of-range field with its documented default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatrixConfig {
    /// Extent of the placement space per axis (integer > 0).
    pub dimensions: u32,
    /// Neighbor-search radius and proximity divisor (integer > 0).
    pub complexity: u32,
    /// Score at or above which a triad becomes validated (0 < t <= 1).
    pub consensus_threshold: f64,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_DIMENSIONS,
            complexity: DEFAULT_COMPLEXITY,
            consensus_threshold: DEFAULT_CONSENSUS_THRESHOLD,
        }
    }
}

impl MatrixConfig {
    /// Replace out-of-range fields with their defaults.
    ///
    /// Returns the corrected config plus the names of replaced fields so
    /// the caller can log them.
    pub fn sanitized(self) -> (Self, Vec<&'static str>) {
        let mut fixed = self;
        let mut replaced = Vec::new();

        if fixed.dimensions == 0 {
            fixed.dimensions = DEFAULT_DIMENSIONS;
            replaced.push("dimensions");
        }
        if fixed.complexity == 0 {
            fixed.complexity = DEFAULT_COMPLEXITY;
            replaced.push("complexity");
        }
        if !(fixed.consensus_threshold > 0.0 && fixed.consensus_threshold <= 1.0)
            || fixed.consensus_threshold.is_nan()
        {
            fixed.consensus_threshold = DEFAULT_CONSENSUS_THRESHOLD;
            replaced.push("consensus_threshold");
        }

        (fixed, replaced)
    }
}
