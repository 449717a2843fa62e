//! Stable record identities.
//!
//! Every request sent to the model carries a `custom_id` of the form
//! `<relative_path>|<index>`. The identity is the only join key between a
//! stage's result stream and the records it was built from, so it must
//! round-trip exactly:
//!
//! ```rust
//! use guideline_synth::identity::Identity;
//!
//! let id = Identity::new("儿科/monkeypox.md", 3).unwrap();
//! assert_eq!(id.to_string(), "儿科/monkeypox.md|3");
//! assert_eq!("儿科/monkeypox.md|3".parse::<Identity>().unwrap(), id);
//! ```
//!
//! Paths are normalized to `/` separators before the identity is formed, so
//! a manifest built on Windows joins against a cache loaded on Linux.

use std::fmt;
use std::str::FromStr;

use crate::error::IdentityError;

/// Reserved separator between the path and the index.
pub const SEPARATOR: char = '|';

/// `(relative_path, index)` pair identifying one record of one file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    path: String,
    index: usize,
}

impl Identity {
    /// Build an identity, normalizing `\` to `/` in the path.
    ///
    /// Fails if the path is empty or contains the reserved separator.
    pub fn new(relative_path: &str, index: usize) -> Result<Self, IdentityError> {
        let path = normalize_path(relative_path);
        if path.is_empty() {
            return Err(IdentityError::EmptyPath);
        }
        if path.contains(SEPARATOR) {
            return Err(IdentityError::ReservedSeparator(path));
        }
        Ok(Self { path, index })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.path, SEPARATOR, self.index)
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, index) = s
            .rsplit_once(SEPARATOR)
            .ok_or_else(|| IdentityError::MissingSeparator(s.to_string()))?;

        // usize::from_str accepts a leading '+' and leading zeros, which would
        // let two strings name the same record.
        if index.is_empty()
            || !index.bytes().all(|b| b.is_ascii_digit())
            || (index.len() > 1 && index.starts_with('0'))
        {
            return Err(IdentityError::InvalidIndex(s.to_string()));
        }
        let index: usize = index
            .parse()
            .map_err(|_| IdentityError::InvalidIndex(s.to_string()))?;

        Identity::new(path, index)
    }
}

/// Normalize a relative path to forward slashes.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}
