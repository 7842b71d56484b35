use serde::{Deserialize, Serialize};

use crate::crypto::{ContentHash, PublicKey};

/// The one frame a requester sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRequest {
    pub file_hash: ContentHash,
    /// Identity of the requesting peer
    pub requester: PublicKey,
}
