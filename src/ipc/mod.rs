//! IPC server for store clients

pub mod protocol;
pub mod server;

pub use protocol::SOCKET_NAME;
pub use server::IpcServer;
