//!
//!
//! View keys: ordered tuples of typed scalars
//!
//!

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::id::EntityId;

/// A geographic point, stored as fixed point 1e-7 degrees so that it is
/// totally ordered and hashable like every other key scalar
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GeoPoint {
    lat: i32,
    lon: i32,
}

const GEO_SCALE: f64 = 1e7;

impl GeoPoint {
    /// Returns `None` for coordinates outside of [-90, 90] x [-180, 180]
    pub fn new(lat: f64, lon: f64) -> Option<Self> {
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return None;
        }

        Some(GeoPoint {
            lat: (lat * GEO_SCALE).round() as i32,
            lon: (lon * GEO_SCALE).round() as i32,
        })
    }

    pub fn lat(&self) -> f64 {
        self.lat as f64 / GEO_SCALE
    }

    pub fn lon(&self) -> f64 {
        self.lon as f64 / GEO_SCALE
    }
}

impl Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.7}, {:.7})", self.lat(), self.lon())
    }
}

/// A single typed element of a [Key]
///
/// Scalars of different kinds order by kind first, in declaration order
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Str(String),
    Geo(GeoPoint),
    Id(EntityId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    Bool,
    Int,
    Str,
    Geo,
    Id,
}

impl Scalar {
    pub fn kind(&self) -> ScalarKind {
        match self {
            Scalar::Bool(_) => ScalarKind::Bool,
            Scalar::Int(_) => ScalarKind::Int,
            Scalar::Str(_) => ScalarKind::Str,
            Scalar::Geo(_) => ScalarKind::Geo,
            Scalar::Id(_) => ScalarKind::Id,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Str(s) => write!(f, "{:?}", s),
            Scalar::Geo(g) => write!(f, "{}", g),
            Scalar::Id(id) => write!(f, "{}", id),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Str(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Str(value)
    }
}

impl From<&String> for Scalar {
    fn from(value: &String) -> Self {
        Scalar::Str(value.clone())
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Scalar::Int(value as i64)
    }
}

impl From<u32> for Scalar {
    fn from(value: u32) -> Self {
        Scalar::Int(value as i64)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl From<GeoPoint> for Scalar {
    fn from(value: GeoPoint) -> Self {
        Scalar::Geo(value)
    }
}

impl From<EntityId> for Scalar {
    fn from(value: EntityId) -> Self {
        Scalar::Id(value)
    }
}

/// A view key. Keys compare lexicographically element by element, so a key
/// always sorts directly before every longer key it is a prefix of
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(Vec<Scalar>);

impl Key {
    pub fn new(parts: Vec<Scalar>) -> Self {
        Key(parts)
    }

    pub fn single(part: impl Into<Scalar>) -> Self {
        Key(vec![part.into()])
    }

    /// Builds `prefix` followed by every element of `rest`
    pub fn prefixed(prefix: Scalar, rest: &Key) -> Self {
        let mut parts = Vec::with_capacity(rest.len() + 1);
        parts.push(prefix);
        parts.extend(rest.0.iter().cloned());
        Key(parts)
    }

    pub fn parts(&self) -> &[Scalar] {
        &self.0
    }

    pub fn first(&self) -> Option<&Scalar> {
        self.0.first()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, part: impl Into<Scalar>) {
        self.0.push(part.into())
    }

    pub fn starts_with(&self, prefix: &Key) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl FromIterator<Scalar> for Key {
    fn from_iter<I: IntoIterator<Item = Scalar>>(iter: I) -> Self {
        Key(iter.into_iter().collect())
    }
}

impl From<Scalar> for Key {
    fn from(value: Scalar) -> Self {
        Key(vec![value])
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", part)?;
        }
        write!(f, "]")
    }
}

/// Builds a [Key] from a list of values convertible into [Scalar]s
///
/// ```
/// use concord_core::{key, Key, Scalar};
/// let k = key!["bob", 7];
/// assert_eq!(k, Key::new(vec![Scalar::from("bob"), Scalar::Int(7)]));
/// ```
#[macro_export]
macro_rules! key {
    ($($part:expr),* $(,)?) => {
        $crate::key::Key::new(::std::vec![$($crate::key::Scalar::from($part)),*])
    };
}

/// The declared shape of the keys a definition emits
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyShape(Vec<ScalarKind>);

impl KeyShape {
    pub fn new(kinds: impl IntoIterator<Item = ScalarKind>) -> Self {
        KeyShape(kinds.into_iter().collect())
    }

    pub fn kinds(&self) -> &[ScalarKind] {
        &self.0
    }

    pub fn matches(&self, key: &Key) -> bool {
        key.len() == self.0.len() && key.parts().iter().zip(self.0.iter()).all(|(part, kind)| part.kind() == *kind)
    }
}
