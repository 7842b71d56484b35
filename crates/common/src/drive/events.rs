use std::path::PathBuf;

/// Something a drive did that an embedder may care about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveEvent {
    /// `ready()` finished
    Ready,
    /// A pre-existing file was indexed while bootstrapping
    Add { filename: String },
    /// A fetch created a file that did not exist locally
    FileAdd { filename: String, path: PathBuf },
    /// A fetch replaced an existing local file
    FileUpdate { filename: String, path: PathBuf },
    /// A remote tombstone removed a local file
    FileUnlink { filename: String, path: PathBuf },
    /// A fetch gave up; the next row or recheck for the file retries it
    FetchFailed { filename: String, error: String },
}

impl DriveEvent {
    pub fn filename(&self) -> Option<&str> {
        match self {
            DriveEvent::Ready => None,
            DriveEvent::Add { filename }
            | DriveEvent::FileAdd { filename, .. }
            | DriveEvent::FileUpdate { filename, .. }
            | DriveEvent::FileUnlink { filename, .. }
            | DriveEvent::FetchFailed { filename, .. } => Some(filename),
        }
    }
}
