//! Wire format for the stdio channel.
//!
//! - **protocol**: envelope type, message ids, handshake and delimiter tokens
//! - **codec**: delimiter framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;

pub use codec::{FrameEncoder, FrameReader};
pub use protocol::{
    Envelope, EnvelopeBuilder, MESSAGE_DELIMITER, MessageId, PROCESS_ALIVE, Query,
};
