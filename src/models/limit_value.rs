use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::okapi::schemars::r#gen::SchemaGenerator;
use rocket_okapi::okapi::schemars::schema::Schema;
use serde::de::{self, Visitor};
use serde::ser;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Canonical entitlement value.
///
/// Raw values are integers, the sentinel `-1`, or the strings `"unlimited"` and
/// `"custom"`. They are resolved once at the boundary (deserialization or
/// [`LimitValue::parse_int`] / [`FromStr`]) and never handled untyped afterwards.
/// Fixed limits are capped at `i64::MAX` so they survive a round trip through
/// signed storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitValue {
    Fixed(u64),
    Unlimited,
    Custom,
}

pub const UNLIMITED_SENTINEL: i64 = -1;

/// Largest fixed limit that can be stored.
pub const MAX_FIXED_LIMIT: u64 = i64::MAX as u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitParseError(pub String);

impl fmt::Display for LimitParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid limit value: {}", self.0)
    }
}

impl std::error::Error for LimitParseError {}

impl LimitValue {
    pub fn parse_int(raw: i64) -> Result<Self, LimitParseError> {
        match raw {
            UNLIMITED_SENTINEL => Ok(LimitValue::Unlimited),
            n if n >= 0 => Ok(LimitValue::Fixed(n as u64)),
            n => Err(LimitParseError(n.to_string())),
        }
    }

    /// Whether one more unit may be consumed when `used` units are already consumed.
    ///
    /// `Fixed(n)` is exhausted once `used` reaches `n`. `Custom` limits are not
    /// enforced numerically here; callers inspect [`LimitValue::is_custom`].
    pub fn contains(&self, used: u64) -> bool {
        match self {
            LimitValue::Unlimited | LimitValue::Custom => true,
            LimitValue::Fixed(n) => used < *n,
        }
    }

    /// Whether `amount` more units fit on top of `used`.
    pub fn allows(&self, used: u64, amount: u64) -> bool {
        match self {
            LimitValue::Unlimited | LimitValue::Custom => true,
            LimitValue::Fixed(n) => used.saturating_add(amount) <= *n,
        }
    }

    /// Units left before exhaustion; `None` for non-numeric limits.
    pub fn remaining(&self, used: u64) -> Option<u64> {
        match self {
            LimitValue::Fixed(n) => Some(n.saturating_sub(used)),
            _ => None,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, LimitValue::Custom)
    }
}

impl Default for LimitValue {
    fn default() -> Self {
        LimitValue::Fixed(0)
    }
}

impl FromStr for LimitValue {
    type Err = LimitParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "unlimited" => Ok(LimitValue::Unlimited),
            "custom" => Ok(LimitValue::Custom),
            other => Err(LimitParseError(format!("'{}'", other))),
        }
    }
}

impl fmt::Display for LimitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitValue::Fixed(n) => write!(f, "{}", n),
            LimitValue::Unlimited => f.write_str("unlimited"),
            LimitValue::Custom => f.write_str("custom"),
        }
    }
}

impl Serialize for LimitValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            LimitValue::Fixed(n) => {
                let n = i64::try_from(*n).map_err(|_| <S::Error as ser::Error>::custom(LimitParseError(n.to_string())))?;
                serializer.serialize_i64(n)
            }
            LimitValue::Unlimited => serializer.serialize_str("unlimited"),
            LimitValue::Custom => serializer.serialize_str("custom"),
        }
    }
}

struct LimitValueVisitor;

impl<'de> Visitor<'de> for LimitValueVisitor {
    type Value = LimitValue;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a non-negative integer, -1, \"unlimited\" or \"custom\"")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<LimitValue, E> {
        LimitValue::parse_int(v).map_err(E::custom)
    }

    fn visit_i32<E: de::Error>(self, v: i32) -> Result<LimitValue, E> {
        self.visit_i64(v as i64)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<LimitValue, E> {
        if v > MAX_FIXED_LIMIT {
            return Err(E::custom(LimitParseError(format!("{} exceeds {}", v, MAX_FIXED_LIMIT))));
        }
        Ok(LimitValue::Fixed(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<LimitValue, E> {
        // i64::MAX as f64 rounds up to 2^63, which is already out of range
        if v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64 {
            self.visit_i64(v as i64)
        } else {
            Err(E::custom(LimitParseError(v.to_string())))
        }
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<LimitValue, E> {
        v.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for LimitValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(LimitValueVisitor)
    }
}

impl JsonSchema for LimitValue {
    fn schema_name() -> String {
        "LimitValue".to_string()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        // integer (>= -1) or one of the sentinel strings
        <serde_json::Value as JsonSchema>::json_schema(generator)
    }
}
