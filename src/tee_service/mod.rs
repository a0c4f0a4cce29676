// Cipher Service Module - caller side of the trust boundary
// Session handle, command protocol, transports and the standalone daemon

pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::CipherSession;
pub use protocol::{
    BufferLayout, Command, CommandId, Operation, Param, WireParam, WireRequest, WireResponse,
    MAX_MESSAGE_SIZE, MAX_SOCKET_BUFFER_SIZE,
};
pub use server::{ServiceSession, TeeServiceServer};
pub use transport::{LocalTransport, SocketTransport, TeeTransport};
