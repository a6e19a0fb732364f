pub mod codec;
pub mod error;
pub mod types;

pub use codec::{decode_message, encode_message, read_message, write_message};
pub use error::WireError;
pub use types::{Message, MessageKind, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
