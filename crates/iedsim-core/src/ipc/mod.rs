//! Local IPC between the GUI and the simulator backend.
//!
//! Length-prefixed msgpack envelopes over a Unix domain socket.
//!
//! # Architecture
//!
//! - **Server**: Accepts connections and reads request frames on the listener thread
//! - **Pool**: Worker threads that run the action router and frame responses
//! - **Client**: Async client used by tests and tooling
//! - **Protocol**: Shared framing and envelope types used by both

pub mod client;
pub mod pool;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use pool::{RequestHandler, Task, WorkerPool};
pub use protocol::{Request, Response};
pub use server::{IpcListener, IpcServerHandle};
