//! Wire protocol shared by the tether hub and its clients.
//!
//! Every frame on the wire is one JSON [`Envelope`]. The hub decodes the
//! envelope once, validates the payload for its [`MessageType`] into a typed
//! [`Message`], and forwards the original envelope so unknown payload fields
//! survive routing untouched.

pub mod codec;
pub mod protocol;

pub use codec::{decode_envelope, encode_envelope, DEFAULT_MAX_ENVELOPE_BYTES};
pub use protocol::*;
