//! Beacon Relay - Core event relay
//!
//! One actor per session coordinates the two sides of the relay:
//! - Ingest: the single worker connection whose events are validated,
//!   persisted, broadcast and interpreted for lifecycle side effects
//! - Stream: any number of observer connections, each getting a
//!   byte-budgeted history replay followed by filtered live events

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broadcast;
pub mod error;
pub mod formatter;
pub mod lifecycle;
pub mod protocol;
pub mod replay;
pub mod session;
pub mod sink;

pub use broadcast::BroadcastRouter;
pub use error::{Error, Result};
pub use lifecycle::LifecycleCoordinator;
pub use protocol::{ErrorCode, ErrorEnvelope, EventKind, IngestFrame, WireEvent};
pub use replay::{ReplayEngine, ReplayStats, ROUND_BYTE_BUDGET};
pub use session::{
    authorize_ingest, IngestPayload, IngestRejection, SessionHandle, SessionRegistry,
    SessionSettings, SessionStores,
};
pub use sink::{ConnectionHandle, OutboundFrame};
