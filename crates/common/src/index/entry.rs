use serde::{Deserialize, Serialize};

use crate::crypto::{ContentHash, PublicKey};

/// Reserved row holding the drive's shared key
pub const PUBLIC_KEY_KEY: &str = "__publicKey";
/// Reserved row holding the access policy
pub const ACCESS_KEY: &str = "__access";

/// Path recorded on index rows. The drive is flat, so every file lives at
///  the root.
pub const ROOT_PATH: &str = "/";

/// Whether a key names one of the reserved rows rather than a file or hash
pub fn is_reserved(key: &str) -> bool {
    key.starts_with("__")
}

/// Whether a filename names a plain top-level file.
///
/// Filenames come off the wire, so anything that could climb out of the
///  drive directory is refused.
pub fn is_plain_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
        && !is_reserved(name)
}

/// The value half of an index row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexValue {
    /// `__publicKey`
    PublicKey { key: PublicKey },
    /// `__access`
    Access(AccessRecord),
    /// keyed by filename
    Name(NameEntry),
    /// keyed by the hex content hash
    Content(ContentEntry),
}

impl IndexValue {
    /// Filename carried by the row, if any.
    ///
    /// Only name tombstones and live content rows carry one; those are the
    ///  rows the reconciler acts on.
    pub fn filename(&self) -> Option<&str> {
        match self {
            IndexValue::Name(NameEntry::Deleted { filename, .. }) => Some(filename),
            IndexValue::Content(ContentEntry::Live(record)) => Some(&record.filename),
            _ => None,
        }
    }
}

/// filename -> hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameEntry {
    Live { hash: ContentHash },
    Deleted { filename: String, path: String },
}

impl NameEntry {
    pub fn hash(&self) -> Option<ContentHash> {
        match self {
            NameEntry::Live { hash } => Some(*hash),
            NameEntry::Deleted { .. } => None,
        }
    }
}

/// hash -> where the bytes live and who wrote them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentEntry {
    Live(FileRecord),
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub hash: ContentHash,
    pub path: String,
    pub size: u64,
    /// Identity of the peer that indexed these bytes; remote peers fetch
    ///  from here.
    pub updated_by: PublicKey,
}

/// Who may write to the drive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub can_read: bool,
    /// Insertion ordered, no duplicates
    pub can_write: Vec<PublicKey>,
}

impl Default for AccessRecord {
    fn default() -> Self {
        Self {
            can_read: true,
            can_write: Vec::new(),
        }
    }
}

impl AccessRecord {
    /// Insert a writer, returning false if it was already present
    pub fn insert(&mut self, writer: PublicKey) -> bool {
        if self.can_write.contains(&writer) {
            return false;
        }
        self.can_write.push(writer);
        true
    }

    pub fn contains(&self, writer: &PublicKey) -> bool {
        self.can_write.contains(writer)
    }
}

/// A row as stored in, and streamed out of, the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: String,
    /// `None` once the key has been deleted
    pub value: Option<IndexValue>,
    /// Feed that authored the row
    pub writer: PublicKey,
    /// Position within the authoring feed
    pub seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;

    #[test]
    fn test_access_record_rejects_duplicates() {
        let a = SecretKey::generate().public();
        let b = SecretKey::generate().public();
        let mut access = AccessRecord::default();

        assert!(access.insert(a));
        assert!(access.insert(b));
        assert!(!access.insert(a));
        assert_eq!(access.can_write, vec![a, b]);
    }

    #[test]
    fn test_only_actionable_rows_carry_filenames() {
        let hash = ContentHash::of(b"hi");
        let record = FileRecord {
            filename: "test.txt".into(),
            hash,
            path: ROOT_PATH.into(),
            size: 2,
            updated_by: SecretKey::generate().public(),
        };

        assert_eq!(
            IndexValue::Content(ContentEntry::Live(record)).filename(),
            Some("test.txt")
        );
        assert_eq!(
            IndexValue::Name(NameEntry::Deleted {
                filename: "test.txt".into(),
                path: ROOT_PATH.into()
            })
            .filename(),
            Some("test.txt")
        );
        assert_eq!(IndexValue::Name(NameEntry::Live { hash }).filename(), None);
        assert_eq!(IndexValue::Content(ContentEntry::Deleted).filename(), None);
        assert!(is_reserved(ACCESS_KEY) && is_reserved(PUBLIC_KEY_KEY));
        assert!(!is_reserved("test.txt"));
    }

    #[test]
    fn test_plain_filenames() {
        assert!(is_plain_filename("test.txt"));
        assert!(is_plain_filename(".hidden"));
        assert!(!is_plain_filename("../etc/passwd"));
        assert!(!is_plain_filename("a/b"));
        assert!(!is_plain_filename(".."));
        assert!(!is_plain_filename(""));
        assert!(!is_plain_filename(ACCESS_KEY));
    }
}
