//! Client-side core of the deal pipeline: sort-key ordering, the optimistic
//! board mirror, drag gestures, and the watchers that keep local views in
//! step with the store of record.

pub mod activity;
pub mod board;
pub mod checklist;
pub mod drag;
pub mod gateway;
pub mod http;
pub mod mirror;
pub mod ordering;
pub mod reconciler;

#[cfg(test)]
mod test_support;

pub use board::{Board, BoardEvent, DropResult};
pub use drag::{DragError, DragOutcome, DragSessionController, DropTarget};
pub use gateway::{DataGateway, Subscription};
pub use http::HttpGateway;
pub use mirror::{MirrorStore, Snapshot, StageGroup};
