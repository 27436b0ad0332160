//! TCP inspection server for bucket streaming
//!
//! Start the server next to your layers:
//! ```ignore
//! let handler = Arc::new(Mutex::new(StreamingInspector::new(layers)));
//! let _server = DebugServer::start(handler, DEFAULT_PORT);
//! ```

pub mod protocol;
pub mod server;

pub use protocol::*;
pub use server::{DebugHandler, DebugServer, ServerError};

/// Default debug server port
pub const DEFAULT_PORT: u16 = 9743;
