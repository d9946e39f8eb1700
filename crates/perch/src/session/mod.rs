//! Per-user sessions against the remote service.
//!
//! - `state`: connection lifecycle, display modes, poll cursors
//! - `events`: commands and completions flowing through the engine task
//! - `engine`: the actor task owning every session
//! - `handle`: cloneable command front for the engine
//! - `poller`: interval tasks driving the two poll pipelines
//! - `mapper`: pure remote-result to link-command translation
//! - `roster`: pure contact reconciliation and mode teardown
//! - `command`: `#`-prefixed gateway commands

mod command;
mod engine;
pub(crate) mod events;
mod handle;
mod mapper;
mod poller;
mod roster;
mod state;

pub use engine::{Engine, EngineConfig};
pub use events::{EngineError, OUTBOUND_CAPACITY, SessionSummary};
pub use handle::EngineHandle;
pub use poller::Poller;
pub use state::{ConnectionState, CursorKind, DisplayMode, StateError};
