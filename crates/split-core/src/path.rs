use std::{fmt, str::FromStr};

use serde::{Serialize, Serializer};
use thiserror::Error;

const SEPARATOR: char = '\\';
const LONG_PATH_PREFIX: &str = "\\\\?\\";

/// Executable path in canonical form.
///
/// The host reports paths with whatever casing and separators the process
/// was started with; two [`ImagePath`] are equal iff they designate the same
/// executable on a case-insensitive file system.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImagePath(String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("empty executable path")]
pub struct EmptyPath;

impl ImagePath {
    /// Normalize a raw path. Never fails: an empty input yields an empty path,
    /// which no inclusion entry can match.
    pub fn normalize(raw: &str) -> Self {
        let unified = raw.trim().replace('/', "\\");
        let stripped = unified.strip_prefix(LONG_PATH_PREFIX).unwrap_or(&unified);

        let mut normalized = String::with_capacity(stripped.len());
        let mut previous_separator = false;
        for c in stripped.chars() {
            if c == SEPARATOR {
                if previous_separator {
                    continue;
                }
                previous_separator = true;
            } else {
                previous_separator = false;
            }
            normalized.extend(c.to_lowercase());
        }
        Self(normalized)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ImagePath {
    type Err = EmptyPath;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let path = Self::normalize(s);
        if path.is_empty() {
            Err(EmptyPath)
        } else {
            Ok(path)
        }
    }
}

impl fmt::Display for ImagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ImagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl Serialize for ImagePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}
