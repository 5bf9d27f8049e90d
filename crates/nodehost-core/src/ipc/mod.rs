//! Newline-delimited JSON-RPC transport between the node, its sandboxes and
//! the container activator service.

mod client;
pub mod messages;
pub mod protocol;
mod server;

pub use client::IpcClient;
pub use server::{handle_action, IpcServer, RequestHandler};
