//! Hash directory: a fixed array of partitions indexed by `hash(value) mod n`
//!
//! There are no gaps and nothing is ever out of range, so locating a value is O(1).

use serde::{Deserialize, Serialize};

use crate::core::{PathmanError, RelationId, Result, Value};

/// Bucket of a hash value among `partitions` buckets
#[must_use]
pub const fn make_hash(value: u32, partitions: u32) -> u32 {
    value % partitions
}

/// Stable 32-bit hash of a partition key.
///
/// Integers of different widths hash alike, so a `SMALLINT` literal routes the
/// same way as the equal `INTEGER` value.
#[must_use]
pub fn hash_value(value: &Value) -> u32 {
    let mut buf = Vec::with_capacity(24);
    match value {
        Value::Null => buf.push(0),
        Value::SmallInt(_) | Value::Integer(_) => {
            buf.push(1);
            buf.extend_from_slice(&value.as_int().unwrap_or_default().to_le_bytes());
        }
        Value::Real(r) => {
            buf.push(2);
            // -0.0 and 0.0 are equal, so they must hash alike
            let r = if *r == 0.0 { 0.0 } else { *r };
            buf.extend_from_slice(&r.to_bits().to_le_bytes());
        }
        Value::Numeric(d) => {
            buf.push(3);
            buf.extend_from_slice(d.normalize().to_string().as_bytes());
        }
        Value::Text(s) => {
            buf.push(4);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Boolean(b) => {
            buf.push(5);
            buf.push(u8::from(*b));
        }
        Value::Date(d) => {
            buf.push(6);
            buf.extend_from_slice(&chrono::Datelike::num_days_from_ce(d).to_le_bytes());
        }
        Value::Timestamp(t) => {
            buf.push(7);
            buf.extend_from_slice(&t.and_utc().timestamp_micros().to_le_bytes());
        }
        Value::TimestampTz(t) => {
            buf.push(8);
            buf.extend_from_slice(&t.timestamp_micros().to_le_bytes());
        }
        Value::Uuid(u) => {
            buf.push(9);
            buf.extend_from_slice(u.as_bytes());
        }
    }

    let h = seahash::hash(&buf);
    (h ^ (h >> 32)) as u32
}

/// Boundary of one hash partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashBucket {
    pub bucket: u32,
    pub buckets: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashDirectory {
    /// Partition of bucket `i` is `partitions[i]`
    partitions: Vec<RelationId>,
}

impl HashDirectory {
    /// Builds the directory from `(bucket, partition)` pairs.
    ///
    /// Every bucket of `0..buckets` must appear exactly once.
    pub fn build(parent: RelationId, children: &[(HashBucket, RelationId)]) -> Result<Self> {
        let Some(first) = children.first() else {
            return Err(PathmanError::inconsistent(parent, "hash partitioned relation has no partitions"));
        };
        let buckets = first.0.buckets;
        if buckets as usize != children.len() {
            return Err(PathmanError::inconsistent(
                parent,
                format!("expected {buckets} hash partitions, found {}", children.len()),
            ));
        }

        let mut partitions = vec![None; buckets as usize];
        for (bound, partition) in children {
            if bound.buckets != buckets || bound.bucket >= buckets {
                return Err(PathmanError::inconsistent(
                    parent,
                    format!("partition {partition} has bucket {}/{}", bound.bucket, bound.buckets),
                ));
            }
            let slot = &mut partitions[bound.bucket as usize];
            if slot.is_some() {
                return Err(PathmanError::inconsistent(
                    parent,
                    format!("bucket {} is assigned twice", bound.bucket),
                ));
            }
            *slot = Some(*partition);
        }

        Ok(Self {
            partitions: partitions.into_iter().flatten().collect(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    #[must_use]
    pub fn partitions(&self) -> &[RelationId] {
        &self.partitions
    }

    #[must_use]
    pub fn partition(&self, bucket: usize) -> Option<RelationId> {
        self.partitions.get(bucket).copied()
    }

    /// Bucket index of `value`; the caller has already checked its type
    #[must_use]
    pub fn bucket_for(&self, value: &Value) -> usize {
        make_hash(hash_value(value), self.partitions.len() as u32) as usize
    }
}
