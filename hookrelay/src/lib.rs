//! Listen/forward core: replays webhook deliveries streamed from the
//! remote dispatcher against a local HTTP server and reports the outcome.

pub mod api;
pub mod attempt;
pub mod event;
pub mod pipeline;
pub mod route;
pub mod session;
pub mod transport;
