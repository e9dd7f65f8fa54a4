//! Type tags
//!
//! A type tag is the 32-bit FNV-1a hash of a proxy type's name. The engine
//! computes the same hash for the type it declares on each object, so a tag
//! can cross the boundary as a plain integer. Two unrelated names hashing to
//! the same tag is a configuration error caught at factory registration.

use serde::{Deserialize, Serialize};
use std::fmt;

const FNV_OFFSET_BASIS: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Stable cross-runtime type identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeTag(u32);

impl TypeTag {
    /// Hash a type name into its tag
    pub const fn of(name: &str) -> Self {
        hash(name)
    }

    /// Wrap a tag computed on the engine side
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// 32-bit FNV-1a over the UTF-8 bytes of `name`
pub const fn hash(name: &str) -> TypeTag {
    let bytes = name.as_bytes();
    let mut state = FNV_OFFSET_BASIS;
    let mut i = 0;
    while i < bytes.len() {
        state ^= bytes[i] as u32;
        state = state.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    TypeTag(state)
}
