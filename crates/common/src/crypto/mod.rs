//! Identity keys and content hashing
//!
//! - **Identity**: Ed25519 keypairs (`SecretKey`/`PublicKey`) identify peers,
//!   writers and drives. A drive's rendezvous topic is the hash of its key.
//! - **Content**: BLAKE3 digests (`ContentHash`) address file bytes. Every
//!   peer computes the same digest for the same bytes, which is what lets the
//!   reconciler decide whether a remote file differs from the local copy.

mod hash;
mod keys;

pub use hash::{ContentHash, ContentHasher, HashParseError, Topic, HASH_SIZE};
pub use keys::{KeyError, PublicKey, SecretKey, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};
