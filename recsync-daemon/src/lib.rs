//! Long-running sync daemon: schedule loop + control socket server.

mod error;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_cancel, request_run, request_status, request_stop, send_request, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{init_tracing, run, start_blocking, RunSummary};
