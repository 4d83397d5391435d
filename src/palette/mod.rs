//! Node-palette subsystem.
//!
//! A palette session is a short-lived server-side context for one user's
//! brainstorming of diagram nodes: a de-duplication set, a stage machine
//! for hierarchical diagram kinds, and a cancellation tree rooted at the
//! session. The streamer fans out to several providers in parallel and
//! merges their output into one ordered event stream.

pub mod session;
pub mod streamer;

pub use session::{normalize_node, PaletteSession, SessionManager};
pub use streamer::{BatchHandle, PaletteEvent, PaletteStreamer};
