// render-sdk: foundation layer for the render worker.
// No dependencies on other workspace crates; provides the trace abstraction,
// subprocess lifecycle management and small string helpers.

pub mod build_constants;
pub mod process_invoker;
pub mod string_util;
pub mod trace;

pub use build_constants::{Source, WorkerPackage};
pub use process_invoker::{
    split_command_line, OutputLine, OutputStream, ProcessCancelledError, ProcessExitCodeError,
    ProcessInvoker, ProcessSpec,
};
pub use string_util::StringUtil;
pub use trace::TraceWriter;
