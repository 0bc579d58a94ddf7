//! Progress display shared by the main process and its workers.
//!
//! A single [`Coordinator`] owns every bar. Callers hold a
//! [`ProgressHandle`] and never touch bar state themselves: each
//! operation is a request answered by the coordinator's primary loop,
//! while a render loop re-orders and redraws on a fixed interval.

mod bar;
mod board;
mod coordinator;
mod handle;
mod layout;
mod local;
mod screen;
mod types;

pub use bar::ProgressBar;
pub use coordinator::{Coordinator, CoordinatorStats, HostTransport};
pub use handle::{BarHandle, ProgressHandle, Proxy, Transport};
pub use layout::{Layout, OrderKey};
pub use local::LocalTransport;
pub use screen::{RenderTarget, Screen, SharedBuffer};
pub use types::{
    BarAttr, BarId, BarOptions, BarValue, Colour, ProgressOp, ProgressRequest, ProgressResponse,
    RequesterId, STATUS_LABEL_WIDTH, status_label,
};
