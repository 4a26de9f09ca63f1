//! Wire protocol shared between the deckhand dashboard server and clients.

pub mod protocol;

pub use protocol::*;
