//! IPC module for daemon status queries

mod protocol;
mod server;

pub use server::Server;
