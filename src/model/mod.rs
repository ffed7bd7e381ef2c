//! Engine Data Model
//!
//! Closed vocabularies for node state, snapshot phases and steps, plus the
//! records the engine reports: nodes, sessions, tables and checksums.

mod checksum;
mod event;
mod lsn;
mod node;
mod session;
mod table;

pub use checksum::{ChecksumRecord, ChecksumStatus};
pub use event::SessionEvent;
pub use lsn::Lsn;
pub use node::{InitState, NodeRecord};
pub use session::{
    CatchupProgress, PhaseProgress, SessionOutcome, SnapshotPhase, SnapshotSession, SnapshotStep,
};
pub use table::{TableProgress, TableStatus};
