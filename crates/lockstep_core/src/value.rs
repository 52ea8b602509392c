//! Typed keys and values for aggregation storages.
//!
//! Aggregations are declared over a closed set of tagged variants instead of
//! runtime type tokens: every registration names a key kind and a value kind,
//! and every write is checked against them. Reduction and end-aggregation
//! functions are stored as typed function values.

use crate::error::ReduceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Key of an aggregation entry. `Unit` is the reserved slot used by the
/// scalar `aggregate(name, value)` engine call; keyed writes use the rest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggKey {
    Unit,
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl AggKey {
    pub fn kind(&self) -> KeyKind {
        match self {
            AggKey::Unit => KeyKind::Unit,
            AggKey::Int(_) => KeyKind::Int,
            AggKey::Text(_) => KeyKind::Text,
            AggKey::Bytes(_) => KeyKind::Bytes,
        }
    }

    /// Stable routing hash used to assign a key to a storage split.
    /// Independent of the process hasher so shard layout is deterministic
    /// across partitions and runs.
    pub fn route_hash(&self) -> u64 {
        // FNV-1a over a variant tag plus the key payload.
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;
        let mut h = OFFSET;
        let mut eat = |bytes: &[u8]| {
            for &b in bytes {
                h ^= u64::from(b);
                h = h.wrapping_mul(PRIME);
            }
        };
        match self {
            AggKey::Unit => eat(&[0u8]),
            AggKey::Int(v) => {
                eat(&[1u8]);
                eat(&v.to_le_bytes());
            }
            AggKey::Text(s) => {
                eat(&[2u8]);
                eat(s.as_bytes());
            }
            AggKey::Bytes(b) => {
                eat(&[3u8]);
                eat(b);
            }
        }
        h
    }
}

impl fmt::Display for AggKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggKey::Unit => write!(f, "()"),
            AggKey::Int(v) => write!(f, "{v}"),
            AggKey::Text(s) => write!(f, "{s}"),
            AggKey::Bytes(b) => write!(f, "{} bytes", b.len()),
        }
    }
}

/// Value of an aggregation entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggValue {
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl AggValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            AggValue::Int(_) => ValueKind::Int,
            AggValue::Float(_) => ValueKind::Float,
            AggValue::Text(_) => ValueKind::Text,
            AggValue::Bytes(_) => ValueKind::Bytes,
        }
    }

    /// Integer payload, if this is an `Int` value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AggValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            AggValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// Type tag for aggregation keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyKind {
    Unit,
    Int,
    Text,
    Bytes,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            KeyKind::Unit => "unit",
            KeyKind::Int => "int",
            KeyKind::Text => "text",
            KeyKind::Bytes => "bytes",
        };
        write!(f, "{label}")
    }
}

/// Type tag for aggregation values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Int,
    Float,
    Text,
    Bytes,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Text => "text",
            ValueKind::Bytes => "bytes",
        };
        write!(f, "{label}")
    }
}

/// Binary merge over aggregation values. Must be associative and commutative:
/// the barrier folds shards in an unspecified order.
pub type Reduction = Arc<dyn Fn(&AggValue, &AggValue) -> Result<AggValue, ReduceError> + Send + Sync>;

/// Optional post-merge transform, applied once per key after the barrier
/// merge and before the value is published.
pub type EndFn = Arc<dyn Fn(&AggValue) -> Result<AggValue, ReduceError> + Send + Sync>;

fn incompatible(left: &AggValue, right: &AggValue) -> ReduceError {
    ReduceError::Incompatible {
        left: left.kind(),
        right: right.kind(),
    }
}

/// Checked addition over `Int` (overflow fails the merge) or `Float` values.
pub fn sum() -> Reduction {
    Arc::new(|left, right| match (left, right) {
        (AggValue::Int(a), AggValue::Int(b)) => a
            .checked_add(*b)
            .map(AggValue::Int)
            .ok_or(ReduceError::Overflow),
        (AggValue::Float(a), AggValue::Float(b)) => Ok(AggValue::Float(a + b)),
        (l, r) => Err(incompatible(l, r)),
    })
}

/// Smaller of two same-kind values. Floats compare with a total order.
pub fn min() -> Reduction {
    Arc::new(|left, right| match (left, right) {
        (AggValue::Int(a), AggValue::Int(b)) => Ok(AggValue::Int(*a.min(b))),
        (AggValue::Float(a), AggValue::Float(b)) => {
            Ok(AggValue::Float(if a.total_cmp(b).is_le() { *a } else { *b }))
        }
        (AggValue::Text(a), AggValue::Text(b)) => Ok(AggValue::Text(a.min(b).clone())),
        (AggValue::Bytes(a), AggValue::Bytes(b)) => Ok(AggValue::Bytes(a.min(b).clone())),
        (l, r) => Err(incompatible(l, r)),
    })
}

/// Larger of two same-kind values. Floats compare with a total order.
pub fn max() -> Reduction {
    Arc::new(|left, right| match (left, right) {
        (AggValue::Int(a), AggValue::Int(b)) => Ok(AggValue::Int(*a.max(b))),
        (AggValue::Float(a), AggValue::Float(b)) => {
            Ok(AggValue::Float(if a.total_cmp(b).is_ge() { *a } else { *b }))
        }
        (AggValue::Text(a), AggValue::Text(b)) => Ok(AggValue::Text(a.max(b).clone())),
        (AggValue::Bytes(a), AggValue::Bytes(b)) => Ok(AggValue::Bytes(a.max(b).clone())),
        (l, r) => Err(incompatible(l, r)),
    })
}
