//!
//!
//! ID types for entities, components, views & definitions
//!
//!

use std::cmp::Ordering;
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// An `EntityId` uniquely identifies a single entity within its entity type
///
/// Entities are owned by primary storage, the engine only ever refers to them.
/// Both UUIDs and ULIDs are 128 bit identifiers and are stored the same way
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdParseError {
    #[error("expected a hyphenated uuid or a 26 character ulid, got {0:?}")]
    Malformed(String),
    #[error("ulid {0:?} overflows 128 bits")]
    Overflow(String),
}

/// Crockford base32, as used by ULIDs
const ULID_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const ULID_LEN: usize = 26;

impl EntityId {
    pub fn new_v4() -> Self {
        EntityId(Uuid::new_v4())
    }

    pub const fn from_u128(raw: u128) -> Self {
        EntityId(Uuid::from_u128(raw))
    }

    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parses either a UUID (any form accepted by [Uuid::parse_str]) or a ULID
    pub fn parse(input: &str) -> Result<Self, IdParseError> {
        if input.len() == ULID_LEN {
            return Self::parse_ulid(input);
        }

        Uuid::parse_str(input)
            .map(EntityId)
            .map_err(|_| IdParseError::Malformed(input.to_string()))
    }

    fn parse_ulid(input: &str) -> Result<Self, IdParseError> {
        let mut raw: u128 = 0;
        for (position, c) in input.bytes().enumerate() {
            let digit = ulid_digit(c).ok_or_else(|| IdParseError::Malformed(input.to_string()))?;

            // 26 * 5 = 130 bits, so the leading character may only carry 3
            if position == 0 && digit > 7 {
                return Err(IdParseError::Overflow(input.to_string()));
            }
            raw = (raw << 5) | digit as u128;
        }
        Ok(EntityId::from_u128(raw))
    }

    /// Renders this id as a ULID string
    pub fn to_ulid(&self) -> String {
        let raw = self.as_u128();
        (0..ULID_LEN)
            .rev()
            .map(|chunk| ULID_ALPHABET[((raw >> (chunk * 5)) & 0x1F) as usize] as char)
            .collect()
    }
}

fn ulid_digit(c: u8) -> Option<u8> {
    match c.to_ascii_uppercase() {
        b'O' => Some(0),
        b'I' | b'L' => Some(1),
        upper => ULID_ALPHABET.iter().position(|a| *a == upper).map(|p| p as u8),
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E[{}]", self.0.hyphenated())
    }
}

impl FromStr for EntityId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityId::parse(s)
    }
}

impl From<Uuid> for EntityId {
    fn from(value: Uuid) -> Self {
        EntityId(value)
    }
}

/// A name paired with a stable 64 bit FNV-1a hash of itself
///
/// Names are compared and hashed through the precomputed hash first, which
/// keeps dispatch lookups cheap no matter how long the names are. The hash is
/// stable across builds, unlike `std::collections::hash_map::DefaultHasher`
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct StableName {
    hash: u64,
    name: Arc<str>,
}

impl StableName {
    pub fn new(name: &str) -> Self {
        StableName {
            hash: Self::hash_of(name),
            name: Arc::from(name),
        }
    }

    pub const fn hash_of(name: &str) -> u64 {
        const_fnv1a_hash::fnv1a_hash_str_64(name)
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn raw_id(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for StableName {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.name == other.name
    }
}

impl Eq for StableName {}

impl Hash for StableName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash)
    }
}

// Ordered by name so that anything keyed on names iterates predictably
impl PartialOrd for StableName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StableName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

impl Display for StableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Debug for StableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.name)
    }
}

impl From<String> for StableName {
    fn from(value: String) -> Self {
        StableName::new(&value)
    }
}

impl From<StableName> for String {
    fn from(value: StableName) -> Self {
        value.name.to_string()
    }
}

macro_rules! stable_name {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(StableName);

        impl $name {
            pub fn new(name: &str) -> Self {
                Self(StableName::new(name))
            }

            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }

            pub fn inner(&self) -> &StableName {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                Display::fmt(&self.0, f)
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{:?}", stringify!($name), self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(&value)
            }
        }

        impl From<&$name> for $name {
            fn from(value: &$name) -> Self {
                value.clone()
            }
        }
    };
}

stable_name!(
    /// The declared type of an entity, e.g. "user" or "forum-thread"
    EntityType
);

stable_name!(
    /// A named component attached to entities, e.g. "login" or "forum-post"
    ComponentName
);

stable_name!(
    /// The name of a view in the view store
    ViewName
);

stable_name!(
    /// The name a view or aggregate definition is registered under
    DefinitionName
);

/// A fully qualified reference to an entity: its type and its id
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub id: EntityId,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<EntityType>, id: EntityId) -> Self {
        EntityRef {
            entity_type: entity_type.into(),
            id,
        }
    }
}

impl Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.id)
    }
}

impl Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.entity_type, self.id)
    }
}

#[test]
fn test_ulid_roundtrip() {
    let id = EntityId::parse("01ARZ3NDEKTSV4RRFFQ69G5FAV").unwrap();
    assert_eq!(id.to_ulid(), "01ARZ3NDEKTSV4RRFFQ69G5FAV");

    // crockford aliases and lowercase decode to the same id
    let aliased = EntityId::parse("01arz3ndektsv4rrffq69g5fav").unwrap();
    assert_eq!(id, aliased);
}

#[test]
fn test_ulid_overflow() {
    assert_eq!(
        EntityId::parse("81ARZ3NDEKTSV4RRFFQ69G5FAV"),
        Err(IdParseError::Overflow("81ARZ3NDEKTSV4RRFFQ69G5FAV".to_string()))
    );
    assert!(matches!(EntityId::parse("not-an-id"), Err(IdParseError::Malformed(_))));
}

#[test]
fn test_uuid_parse() {
    let id = EntityId::parse("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
    assert_eq!(id.to_string(), "67e55044-10b1-426f-9247-bb680e5fe0c8");
}

#[test]
fn test_stable_names() {
    let a = ComponentName::new("login");
    let b = ComponentName::from("login".to_string());
    assert_eq!(a, b);
    assert_eq!(a.inner().raw_id(), StableName::hash_of("login"));
    assert_ne!(a, ComponentName::new("forum-post"));
    assert!(ViewName::new("a") < ViewName::new("b"));
}
