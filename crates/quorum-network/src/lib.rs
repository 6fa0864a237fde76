//! Wire protocol of the consensus core: message payloads, the versioned
//! length-prefixed frame codec, and the inbound dispatcher. Transport is out
//! of scope; senders are injected behind the [`MsgSender`] trait.

pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod messages;

pub use codec::{decode_frame, encode_frame, MAX_MESSAGE_SIZE, WIRE_VERSION};
pub use dispatcher::{Dispatcher, MessageHandler, MsgSender};
pub use error::{NetworkError, Result};
pub use messages::WireMessage;
