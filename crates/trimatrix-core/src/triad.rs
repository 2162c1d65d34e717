// crates/trimatrix-core/src/triad.rs

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::MatrixError;

/// A 3-axis coordinate assigned to a triad at creation.
///
/// Positions are derived metadata used only for neighbor search. They are
/// not unique: two triads may share a position, and no invariant is built
/// on top of positional identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    /// Sample a position uniformly per axis in `[0, dimensions)`.
    pub fn sample(dimensions: u32) -> Self {
        let mut rng = rand::thread_rng();
        let bound = f64::from(dimensions);
        Self {
            x: rng.gen_range(0.0..bound),
            y: rng.gen_range(0.0..bound),
            z: rng.gen_range(0.0..bound),
        }
    }

    /// Euclidean distance to another position.
    pub fn distance(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// The atomic unit of stored and replicated state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Triad {
    /// Unique identifier, generated locally at creation.
    pub id: Uuid,
    /// Opaque payload: a non-empty structured record or a non-empty string.
    pub data: Value,
    /// Caller-supplied creator identifier (not verified by the core).
    pub creator: String,
    /// Creation instant.
    pub timestamp: DateTime<Utc>,
    /// Placement coordinate, sampled at creation.
    pub position: Position,
    /// Reserved: neighbors are computed on demand by distance, not stored.
    #[serde(default)]
    pub connections: Vec<Uuid>,
    /// Monotonic: once true it never reverts.
    pub validated: bool,
    /// Most recent consensus score, in [0, 1].
    pub consensus: f64,
    /// Incremented on every validation call that is evaluated.
    pub validation_attempts: u32,
}

impl Triad {
    /// Build a fresh, unvalidated triad with a sampled position.
    ///
    /// Callers are expected to have run [`validate_triad_data`] and
    /// [`validate_identity`] first; this constructor does not re-check.
    pub fn new(data: Value, creator: String, dimensions: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            data,
            creator,
            timestamp: Utc::now(),
            position: Position::sample(dimensions),
            connections: Vec::new(),
            validated: false,
            consensus: 0.0,
            validation_attempts: 0,
        }
    }
}

/// Check that triad data is a non-empty JSON object or a non-empty string.
pub fn validate_triad_data(data: &Value) -> Result<(), MatrixError> {
    match data {
        Value::Object(map) if !map.is_empty() => Ok(()),
        Value::Object(_) => Err(MatrixError::InvalidInput(
            "triad data record must have at least one field".to_string(),
        )),
        Value::String(s) if !s.is_empty() => Ok(()),
        Value::String(_) => Err(MatrixError::InvalidInput(
            "triad data string must be non-empty".to_string(),
        )),
        other => Err(MatrixError::InvalidInput(format!(
            "triad data must be a record or string, got {}",
            json_type_name(other)
        ))),
    }
}

/// Check that a creator/validator identity string is non-empty.
pub fn validate_identity(id: &str, what: &str) -> Result<(), MatrixError> {
    if id.is_empty() {
        return Err(MatrixError::InvalidInput(format!(
            "{} id must be a non-empty string",
            what
        )));
    }
    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
