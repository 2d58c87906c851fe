pub mod consts;
pub mod error;
pub mod frame_socket;

pub use error::SocketError;
pub use frame_socket::FrameSocket;
