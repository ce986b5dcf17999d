//! EVCP Core Library
//!
//! Wire protocol shared by charging point engines, monitors and the central
//! controller: message types, the STX/ETX/LRC frame codec and a retrying TCP
//! session client.

pub mod types;
pub mod error;
pub mod frame;
pub mod transport;

pub use types::*;
pub use error::{FrameError, LinkError};
pub use frame::{Decoded, FrameCodec, MAX_FRAME_LEN};
pub use transport::{connect, connect_once, Link, Received, RetryPolicy};
