//! Offline sync core
//!
//! Push/pull reconciliation for disconnected point-of-sale devices. A
//! device pushes a batch of locally recorded events; each one is evaluated
//! independently against the entity store and the event ledger, and every
//! rejection leaves a conflict row for audit. Pull exports everything
//! changed after a watermark.

mod feed;
mod reconciler;
mod store;
mod types;

pub use feed::ChangeFeed;
pub use reconciler::Reconciler;
pub use store::{ConflictLogRepository, ConflictRecord, EventLogRepository, NewConflict, NewEvent};
pub use types::{
    ConflictType, EntityKind, EventResult, EventStatus, PullResponse, PushRequest, PushResponse,
    RawEvent,
};
