//! Key ranges for range-based sharding
//!
//! A range is a half-open interval `[min, max)`. String midpoints are
//! computed by big-integer interpolation over printable-ASCII digit
//! strings, which bisects lexicographic space correctly; character-code
//! averaging does not and is not used here.

use serde::{Deserialize, Serialize};

use crate::error::ShardError;
use crate::types::{KeyValue, ShardId};

/// First byte of the interpolation alphabet (printable ASCII)
const ALPHA_MIN: u8 = 0x20;
/// Last byte of the interpolation alphabet
const ALPHA_MAX: u8 = 0x7e;
/// Radix of the interpolation alphabet
const RADIX: u32 = (ALPHA_MAX - ALPHA_MIN + 1) as u32;

/// Half-open key interval `[min, max)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive lower bound
    pub min: KeyValue,
    /// Exclusive upper bound
    pub max: KeyValue,
}

impl KeyRange {
    /// Create a range; `min` must order strictly below `max`
    pub fn new(min: KeyValue, max: KeyValue) -> Result<Self, ShardError> {
        if min >= max {
            return Err(ShardError::InvalidConfig(format!(
                "range min {} must be below max {}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// Containment check: `min <= key < max`
    pub fn contains(&self, key: &KeyValue) -> bool {
        *key >= self.min && *key < self.max
    }

    /// Whether two half-open intervals intersect
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.min < other.max && other.min < self.max
    }

    /// Approximate width, used for imbalance scoring
    ///
    /// Numeric ranges report their exact span; string ranges report the
    /// difference of their bounds interpreted as base-95 fractions.
    pub fn width(&self) -> f64 {
        match (&self.min, &self.max) {
            (KeyValue::Num(a), KeyValue::Num(b)) => (*b as i128 - *a as i128) as f64,
            _ => text_fraction(&self.max.routing_str()) - text_fraction(&self.min.routing_str()),
        }
    }

    /// Midpoint suitable for splitting the range in two
    ///
    /// Fails with `UnsplittableRange` when no key strictly between the
    /// bounds exists.
    pub fn midpoint(&self) -> Result<KeyValue, ShardError> {
        match (&self.min, &self.max) {
            (KeyValue::Num(a), KeyValue::Num(b)) => {
                let mid = (*a as i128 + *b as i128) / 2;
                let mid = mid as i64;
                if mid == *a {
                    return Err(ShardError::UnsplittableRange(format!("[{}, {})", a, b)));
                }
                Ok(KeyValue::Num(mid))
            }
            _ => {
                let mid = string_midpoint(&self.min.routing_str(), &self.max.routing_str())?;
                Ok(KeyValue::Str(mid))
            }
        }
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

/// A key range owned by a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRange {
    /// Owned interval
    pub range: KeyRange,
    /// Owning shard
    pub shard_id: ShardId,
}

impl ShardRange {
    pub fn new(range: KeyRange, shard_id: impl Into<ShardId>) -> Self {
        Self {
            range,
            shard_id: shard_id.into(),
        }
    }
}

/// Map a string's leading bytes to a base-95 fraction in `[0, 1)`
fn text_fraction(s: &str) -> f64 {
    let mut value = 0.0;
    let mut scale = 1.0 / RADIX as f64;
    for &b in s.as_bytes().iter().take(8) {
        value += digit_of(b) as f64 * scale;
        scale /= RADIX as f64;
    }
    value
}

fn digit_of(b: u8) -> u32 {
    (b.clamp(ALPHA_MIN, ALPHA_MAX) - ALPHA_MIN) as u32
}

/// Lexicographic midpoint of two strings
///
/// Interprets both strings as base-95 fractions over printable ASCII,
/// averages them with big-integer digit arithmetic, and renders the
/// result back. The result `m` satisfies `lo < m < hi` bytewise.
fn string_midpoint(lo: &str, hi: &str) -> Result<String, ShardError> {
    if lo >= hi {
        return Err(ShardError::InvalidConfig(format!(
            "midpoint bounds out of order: {} >= {}",
            lo, hi
        )));
    }

    // One extra digit of precision guarantees a value strictly between
    // the bounds whenever the alphabet admits one.
    let len = lo.len().max(hi.len()) + 1;
    let lo_digits: Vec<u32> = pad_digits(lo, len);
    let hi_digits: Vec<u32> = pad_digits(hi, len);

    // sum = lo + hi, digit-wise with carry
    let mut sum = vec![0u32; len];
    let mut carry = 0u32;
    for i in (0..len).rev() {
        let s = lo_digits[i] + hi_digits[i] + carry;
        sum[i] = s % RADIX;
        carry = s / RADIX;
    }

    // mid = sum / 2, remainder flows rightward
    let mut mid = vec![0u32; len];
    let mut rem = carry; // the overflow digit from the addition
    for (i, slot) in mid.iter_mut().enumerate() {
        let cur = rem * RADIX + sum[i];
        *slot = cur / 2;
        rem = cur % 2;
    }

    let bytes: Vec<u8> = mid.iter().map(|&d| ALPHA_MIN + d as u8).collect();
    // Alphabet is printable ASCII, always valid UTF-8
    let result = String::from_utf8(bytes)
        .map_err(|e| ShardError::InvalidConfig(format!("midpoint encoding: {}", e)))?;

    // Trim trailing minimum digits that add nothing, but keep the
    // result strictly above the lower bound.
    let trimmed = result.trim_end_matches(ALPHA_MIN as char);
    let result = if !trimmed.is_empty() && trimmed > lo && trimmed < hi {
        trimmed.to_string()
    } else {
        result
    };

    if result.as_str() <= lo || result.as_str() >= hi {
        return Err(ShardError::UnsplittableRange(format!("[{}, {})", lo, hi)));
    }
    Ok(result)
}

fn pad_digits(s: &str, len: usize) -> Vec<u32> {
    let mut digits: Vec<u32> = s.bytes().take(len).map(digit_of).collect();
    digits.resize(len, 0);
    digits
}
