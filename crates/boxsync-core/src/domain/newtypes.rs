//! Domain newtypes with validation
//!
//! This module provides strongly-typed wrappers for domain identifiers and values.
//! Each newtype ensures data validity at construction time.

use std::fmt::{self, Display, Formatter};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

// ============================================================================
// Numeric ID types
// ============================================================================

/// Identifier of a recorded change event (database row ID)
///
/// Event IDs are allocated by the local index and increase monotonically,
/// so they also encode submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(i64);

impl EventId {
    /// Create an EventId from an i64 value
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    #[must_use]
    pub const fn as_i64(&self) -> i64 {
        self.0
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>()
            .map(Self)
            .map_err(|e| DomainError::InvalidId(format!("Invalid EventId: {e}")))
    }
}

impl From<i64> for EventId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Identifier of the syncbox (remote container) this engine mirrors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncboxId(i64);

impl SyncboxId {
    /// Create a SyncboxId from an i64 value
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    #[must_use]
    pub const fn as_i64(&self) -> i64 {
        self.0
    }
}

impl Display for SyncboxId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of this device as registered with the server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new DeviceId
    ///
    /// # Errors
    /// Returns error if the id is empty or contains whitespace
    pub fn new(id: String) -> Result<Self, DomainError> {
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(DomainError::InvalidId(format!("Invalid DeviceId: {id:?}")));
        }
        Ok(Self(id))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

// ============================================================================
// Path types
// ============================================================================

/// A validated absolute local path
///
/// SyncPath ensures the path is:
/// - Absolute (starts with /)
/// - Normalized (no . or .. components)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PathBuf", into = "PathBuf")]
pub struct SyncPath(PathBuf);

impl SyncPath {
    /// Create a new SyncPath, validating it is absolute
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if the path is not absolute
    pub fn new(path: PathBuf) -> Result<Self, DomainError> {
        if !path.is_absolute() {
            return Err(DomainError::InvalidPath(format!(
                "Path must be absolute: {}",
                path.display()
            )));
        }

        let normalized = Self::normalize_path(&path)?;
        Ok(Self(normalized))
    }

    /// Get the inner path reference
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Convert to owned PathBuf
    #[must_use]
    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    /// Express `path` relative to this root
    ///
    /// # Errors
    /// Returns error if `path` is not strictly inside this root or cannot
    /// be represented as a [`RelativePath`]
    pub fn relativize(&self, path: &Path) -> Result<RelativePath, DomainError> {
        let stripped = path.strip_prefix(&self.0).map_err(|_| {
            DomainError::PathNotInSyncRoot(format!(
                "{} is not within {}",
                path.display(),
                self.0.display()
            ))
        })?;
        RelativePath::from_path(stripped)
    }

    /// Resolve a relative path against this root
    #[must_use]
    pub fn resolve(&self, relative: &RelativePath) -> PathBuf {
        let mut out = self.0.clone();
        for segment in relative.segments() {
            out.push(segment);
        }
        out
    }

    /// Normalize a path by resolving . and .. components
    fn normalize_path(path: &Path) -> Result<PathBuf, DomainError> {
        let mut normalized = PathBuf::new();

        for component in path.components() {
            match component {
                Component::Prefix(p) => normalized.push(p.as_os_str()),
                Component::RootDir => normalized.push("/"),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(DomainError::InvalidPath(
                            "Path escapes root via ..".to_string(),
                        ));
                    }
                }
                Component::Normal(c) => normalized.push(c),
            }
        }

        Ok(normalized)
    }
}

impl Display for SyncPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl TryFrom<PathBuf> for SyncPath {
    type Error = DomainError;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        Self::new(path)
    }
}

impl From<SyncPath> for PathBuf {
    fn from(sync_path: SyncPath) -> Self {
        sync_path.0
    }
}

impl AsRef<Path> for SyncPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// A path inside the sync root, as exchanged with the server
///
/// Format: `/`-separated segments with no leading or trailing slash,
/// e.g. `"Documents/report.txt"`. The root itself is not representable;
/// every RelativePath names an item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelativePath(String);

impl RelativePath {
    /// Create a new RelativePath
    ///
    /// # Errors
    /// Returns error if the path is empty, absolute, or contains empty,
    /// `.` or `..` segments
    pub fn new(path: String) -> Result<Self, DomainError> {
        if path.is_empty() {
            return Err(DomainError::InvalidPath(
                "Relative path cannot be empty".to_string(),
            ));
        }
        if path.starts_with('/') || path.ends_with('/') {
            return Err(DomainError::InvalidPath(format!(
                "Relative path must not start or end with '/': {path}"
            )));
        }
        if path.contains('\0') || path.contains('\\') {
            return Err(DomainError::InvalidPath(format!(
                "Relative path contains a forbidden character: {path:?}"
            )));
        }
        for segment in path.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(DomainError::InvalidPath(format!(
                    "Relative path contains an invalid segment: {path}"
                )));
            }
        }
        Ok(Self(path))
    }

    /// Build a RelativePath from a relative filesystem path
    ///
    /// # Errors
    /// Returns error for non-UTF-8 or non-normal components
    pub fn from_path(path: &Path) -> Result<Self, DomainError> {
        let mut segments = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(c) => match c.to_str() {
                    Some(s) => segments.push(s),
                    None => {
                        return Err(DomainError::InvalidPath(format!(
                            "Path is not valid UTF-8: {}",
                            path.display()
                        )))
                    }
                },
                Component::CurDir => {}
                _ => {
                    return Err(DomainError::InvalidPath(format!(
                        "Path is not a plain relative path: {}",
                        path.display()
                    )))
                }
            }
        }
        Self::new(segments.join("/"))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the `/`-separated segments
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Join a single path component
    ///
    /// # Errors
    /// Returns error if component is invalid
    pub fn join(&self, component: &str) -> Result<Self, DomainError> {
        if component.contains('/') {
            return Err(DomainError::InvalidPath(format!(
                "Invalid path component: {component}"
            )));
        }
        Self::new(format!("{}/{component}", self.0))
    }

    /// Get the parent path (`None` for top-level items)
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.0.rfind('/').map(|idx| Self(self.0[..idx].to_string()))
    }

    /// Get the last segment
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Replace the last segment
    ///
    /// # Errors
    /// Returns error if `name` is not a valid single segment
    pub fn with_file_name(&self, name: &str) -> Result<Self, DomainError> {
        match self.parent() {
            Some(parent) => parent.join(name),
            None => Self::new(name.to_string()),
        }
    }

    /// Whether `self` is strictly below the folder `ancestor`
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &RelativePath) -> bool {
        self.0.len() > ancestor.0.len()
            && self.0.starts_with(&ancestor.0)
            && self.0.as_bytes()[ancestor.0.len()] == b'/'
    }

    /// Move this path from below `old_prefix` to below `new_prefix`
    ///
    /// Returns `None` when the path is neither `old_prefix` nor one of its
    /// descendants.
    #[must_use]
    pub fn rebase(&self, old_prefix: &RelativePath, new_prefix: &RelativePath) -> Option<Self> {
        if self == old_prefix {
            return Some(new_prefix.clone());
        }
        if self.is_descendant_of(old_prefix) {
            let rest = &self.0[old_prefix.0.len()..];
            return Some(Self(format!("{}{rest}", new_prefix.0)));
        }
        None
    }
}

impl Display for RelativePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RelativePath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for RelativePath {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RelativePath> for String {
    fn from(path: RelativePath) -> Self {
        path.0
    }
}

// ============================================================================
// Server-side identifiers
// ============================================================================

/// Opaque server identifier of a stored item
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerUid(String);

impl ServerUid {
    /// Create a new ServerUid
    ///
    /// # Errors
    /// Returns error if the id is empty or contains characters outside
    /// `[A-Za-z0-9_-]`
    pub fn new(id: String) -> Result<Self, DomainError> {
        if id.is_empty() {
            return Err(DomainError::InvalidServerUid(
                "Server uid cannot be empty".to_string(),
            ));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DomainError::InvalidServerUid(format!(
                "Server uid contains invalid characters: {id}"
            )));
        }
        Ok(Self(id))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ServerUid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ServerUid {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for ServerUid {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ServerUid> for String {
    fn from(id: ServerUid) -> Self {
        id.0
    }
}

/// 128-bit content digest (MD5 of the file content)
///
/// Serialized as 32 lowercase hex characters, which is also the format the
/// server uses.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest128([u8; 16]);

impl Digest128 {
    /// Wrap raw digest bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Parse a hex-encoded digest
    ///
    /// # Errors
    /// Returns error if the input is not exactly 32 hex characters
    pub fn from_hex(s: &str) -> Result<Self, DomainError> {
        let decoded = hex::decode(s)
            .map_err(|e| DomainError::InvalidDigest(format!("{s}: {e}")))?;
        let bytes: [u8; 16] = decoded.try_into().map_err(|v: Vec<u8>| {
            DomainError::InvalidDigest(format!("expected 16 bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Lowercase hex form
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for Digest128 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Digest128({})", self.to_hex())
    }
}

impl Display for Digest128 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Digest128 {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for Digest128 {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

impl From<Digest128> for String {
    fn from(digest: Digest128) -> Self {
        digest.to_hex()
    }
}

/// Server change-list cursor (opaque string)
///
/// The cursor is opaque; we only validate that it is non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cursor(String);

impl Cursor {
    /// Create a new Cursor
    ///
    /// # Errors
    /// Returns error if the cursor is empty
    pub fn new(cursor: String) -> Result<Self, DomainError> {
        if cursor.is_empty() {
            return Err(DomainError::InvalidCursor(
                "Cursor cannot be empty".to_string(),
            ));
        }
        Ok(Self(cursor))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Cursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Cursor {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<Cursor> for String {
    fn from(cursor: Cursor) -> Self {
        cursor.0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    mod event_id_tests {
        use super::*;

        #[test]
        fn test_ordering_follows_value() {
            assert!(EventId::new(1) < EventId::new(2));
        }

        #[test]
        fn test_from_str() {
            let id: EventId = "42".parse().unwrap();
            assert_eq!(id.as_i64(), 42);
            assert!("x".parse::<EventId>().is_err());
        }
    }

    mod sync_path_tests {
        use super::*;

        #[test]
        fn test_new_absolute_path() {
            let path = SyncPath::new(PathBuf::from("/home/user/Box")).unwrap();
            assert_eq!(path.to_string(), "/home/user/Box");
        }

        #[test]
        fn test_new_relative_path_fails() {
            assert!(SyncPath::new(PathBuf::from("relative/path")).is_err());
        }

        #[test]
        fn test_normalizes_dot_segments() {
            let path = SyncPath::new(PathBuf::from("/home/user/./Box/../Box")).unwrap();
            assert_eq!(path.to_string(), "/home/user/Box");
        }

        #[test]
        fn test_relativize_and_resolve() {
            let root = SyncPath::new(PathBuf::from("/home/user/Box")).unwrap();
            let rel = root
                .relativize(Path::new("/home/user/Box/docs/a.txt"))
                .unwrap();
            assert_eq!(rel.as_str(), "docs/a.txt");
            assert_eq!(
                root.resolve(&rel),
                PathBuf::from("/home/user/Box/docs/a.txt")
            );
        }

        #[test]
        fn test_relativize_outside_root_fails() {
            let root = SyncPath::new(PathBuf::from("/home/user/Box")).unwrap();
            assert!(root.relativize(Path::new("/home/other/a.txt")).is_err());
        }

        #[test]
        fn test_relativize_root_itself_fails() {
            let root = SyncPath::new(PathBuf::from("/home/user/Box")).unwrap();
            assert!(root.relativize(Path::new("/home/user/Box")).is_err());
        }
    }

    mod relative_path_tests {
        use super::*;

        #[test]
        fn test_new_valid() {
            let path = RelativePath::new("docs/a.txt".to_string()).unwrap();
            assert_eq!(path.as_str(), "docs/a.txt");
        }

        #[test]
        fn test_invalid_forms_fail() {
            for bad in ["", "/abs", "trailing/", "a//b", "a/../b", "./a", "a\\b"] {
                assert!(RelativePath::new(bad.to_string()).is_err(), "{bad}");
            }
        }

        #[test]
        fn test_parent_and_file_name() {
            let path: RelativePath = "a/b/c.txt".parse().unwrap();
            assert_eq!(path.file_name(), "c.txt");
            assert_eq!(path.parent().unwrap().as_str(), "a/b");

            let top: RelativePath = "top.txt".parse().unwrap();
            assert!(top.parent().is_none());
            assert_eq!(top.file_name(), "top.txt");
        }

        #[test]
        fn test_with_file_name() {
            let path: RelativePath = "a/b.txt".parse().unwrap();
            assert_eq!(path.with_file_name("c.txt").unwrap().as_str(), "a/c.txt");
        }

        #[test]
        fn test_descendant_requires_separator() {
            let folder: RelativePath = "docs".parse().unwrap();
            let child: RelativePath = "docs/a.txt".parse().unwrap();
            let sibling: RelativePath = "docs2/a.txt".parse().unwrap();
            assert!(child.is_descendant_of(&folder));
            assert!(!sibling.is_descendant_of(&folder));
            assert!(!folder.is_descendant_of(&folder));
        }

        #[test]
        fn test_rebase() {
            let old: RelativePath = "docs".parse().unwrap();
            let new: RelativePath = "archive/docs".parse().unwrap();
            let child: RelativePath = "docs/x/a.txt".parse().unwrap();
            assert_eq!(
                child.rebase(&old, &new).unwrap().as_str(),
                "archive/docs/x/a.txt"
            );
            assert_eq!(old.rebase(&old, &new).unwrap(), new);
            let other: RelativePath = "other.txt".parse().unwrap();
            assert!(other.rebase(&old, &new).is_none());
        }

        #[test]
        fn test_from_path() {
            let path = RelativePath::from_path(Path::new("a/./b")).unwrap();
            assert_eq!(path.as_str(), "a/b");
            assert!(RelativePath::from_path(Path::new("../a")).is_err());
        }
    }

    mod server_uid_tests {
        use super::*;

        #[test]
        fn test_valid_uid() {
            assert!(ServerUid::new("S1-abc_9".to_string()).is_ok());
        }

        #[test]
        fn test_invalid_uid() {
            assert!(ServerUid::new(String::new()).is_err());
            assert!(ServerUid::new("a b".to_string()).is_err());
        }
    }

    mod digest_tests {
        use super::*;

        #[test]
        fn test_hex_roundtrip() {
            let digest = Digest128::from_hex("d41d8cd98f00b204e9800998ecf8427e").unwrap();
            assert_eq!(digest.to_hex(), "d41d8cd98f00b204e9800998ecf8427e");
        }

        #[test]
        fn test_wrong_length_fails() {
            assert!(Digest128::from_hex("abcd").is_err());
            assert!(Digest128::from_hex("zz1d8cd98f00b204e9800998ecf8427e").is_err());
        }

        #[test]
        fn test_serde_uses_hex_string() {
            let digest = Digest128::from_bytes([0xab; 16]);
            let json = serde_json::to_string(&digest).unwrap();
            assert_eq!(json, format!("\"{}\"", "ab".repeat(16)));
            let parsed: Digest128 = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, digest);
        }
    }

    mod cursor_tests {
        use super::*;

        #[test]
        fn test_empty_fails() {
            assert!(Cursor::new(String::new()).is_err());
            assert_eq!(Cursor::new("c1".to_string()).unwrap().as_str(), "c1");
        }
    }
}
