//! # galena-evs: EVS support structures
//!
//! Data structures populated and consumed by the Extended Virtual Synchrony
//! membership layer:
//!
//! - [`InputMap`] — a per-view, per-source ordered message buffer that
//!   reconstructs a causally ordered stream, tracking the per-source
//!   "all-received-up-to" and the cluster-wide "safe-to-deliver" watermarks
//! - [`ViewState`] — the `gvwstate.dat` persistence of the last known
//!   primary view, used to restore a primary component after full-cluster
//!   restart
//!
//! The membership algorithm itself lives with the group-communication
//! collaborator; this crate owns only its state.

pub mod input_map;
pub mod viewstate;

pub use input_map::{InputMap, Order, Range, UserMessage};
pub use viewstate::{ViewState, ViewStateError};
