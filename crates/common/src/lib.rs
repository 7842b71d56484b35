/**
 * Who may write to a drive.
 *  - Owner/Writer drives keep the policy as a
 *    replicated `__access` row
 *  - ReaderOnly drives keep a local mirror of it
 */
pub mod access;
/**
 * Cryptographic types and operations.
 *  - Public and Private key implementations
 *  - Content hashing and discovery topics
 */
pub mod crypto;
/**
 * The drive orchestrator: lifecycle, local
 *  watching, remote reconciliation.
 */
pub mod drive;
/**
 * The replicated, multi-writer index a drive
 *  keeps its file metadata in, and an in-process
 *  implementation of it.
 */
pub mod index;
/**
 * Topic-scoped peer rendezvous.
 *  Trait plus an in-memory network and an
 *  iroh-backed transport.
 */
pub mod swarm;
/**
 * Test harness for multi-drive tests over
 *  an in-memory network.
 */
pub mod testkit;
/**
 * File request/response over a peer connection.
 */
pub mod transfer;
/**
 * Length-prefixed bincode framing shared by
 *  replication and transfer.
 */
pub mod wire;

pub mod prelude {
    pub use crate::access::{PeerGrant, Role};
    pub use crate::crypto::{ContentHash, PublicKey, SecretKey, Topic};
    pub use crate::drive::{Drive, DriveBuilder, DriveConfig, DriveError, DriveEvent, DriveState};
    pub use crate::index::{IndexProvider, MemoryIndex};
    pub use crate::swarm::{IrohSwarm, MemoryNetwork, Swarm};
}
