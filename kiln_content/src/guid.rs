use std::{
    fmt::{self, Formatter},
    fs, io,
    path::Path,
    str::FromStr,
};

use kiln_shared::uuid::Uuid;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Stable identifier of an artifact. The braced string form is the file name of the
/// artifact in the import cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Guid(Uuid);

impl Guid {
    /// Creates a new random [`Guid`].
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses the braced (`{...}`) or plain hyphenated form.
    ///
    /// # Example
    ///
    /// ```rust
    /// use kiln_content::Guid;
    /// let guid = Guid::parse("{67e55044-10b1-426f-9247-bb680e5fe0c8}").unwrap();
    /// assert_eq!(guid.to_string(), "{67e55044-10b1-426f-9247-bb680e5fe0c8}");
    /// assert!(Guid::parse("index").is_err());
    /// ```
    pub fn parse(value: &str) -> Result<Self> {
        Uuid::parse_str(value.trim())
            .map(Self)
            .map_err(|_| Error::InvalidGuid(value.to_owned()))
    }

    /// Derives a [`Guid`] from a name. The same name always results in the same [`Guid`].
    pub fn from_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut truncated = [0u8; 16];
        truncated.copy_from_slice(&digest[..16]);
        Self(Uuid::from_bytes(truncated))
    }
}

impl Default for Guid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.braced())
    }
}

impl FromStr for Guid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Guid::parse(&value).map_err(de::Error::custom)
    }
}

/// Digest of the raw bytes of a source file, formatted like a [`Guid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(Uuid);

impl ContentHash {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut truncated = [0u8; 16];
        truncated.copy_from_slice(&digest[..16]);
        Self(Uuid::from_bytes(truncated))
    }

    pub fn of_file(path: &Path) -> io::Result<Self> {
        fs::read(path).map(|bytes| Self::of_bytes(&bytes))
    }

    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value.trim()).ok().map(Self)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.braced())
    }
}

/// Stable numeric id of a type name. It's written next to the type name into the sidecar files.
pub fn type_id(type_name: &str) -> u32 {
    let digest = Sha256::digest(type_name.as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[cfg(test)]
mod tests {
    use kiln_shared::serde_json;

    use super::*;

    #[test]
    fn guid_is_braced() {
        let guid = Guid::new();
        let text = guid.to_string();
        assert!(text.starts_with('{') && text.ends_with('}'));
        assert_eq!(Guid::parse(&text).unwrap(), guid);
    }

    #[test]
    fn guid_serializes_as_string() {
        let guid = Guid::new();
        let json = serde_json::to_string(&guid).unwrap();
        assert_eq!(json, format!("\"{guid}\""));
        assert_eq!(serde_json::from_str::<Guid>(&json).unwrap(), guid);
    }

    #[test]
    fn content_hash_depends_on_content() {
        let a = ContentHash::of_bytes(b"Hello World!");
        let b = ContentHash::of_bytes(b"Hello World!");
        let c = ContentHash::of_bytes(b"Hello Universe!");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(ContentHash::parse(&a.to_string()), Some(a));
    }

    #[test]
    fn type_id_is_stable() {
        assert_eq!(type_id("Text"), type_id("Text"));
        assert_ne!(type_id("Text"), type_id("Mesh"));
    }
}
