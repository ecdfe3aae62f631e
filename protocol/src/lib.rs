//! The message schema shared between the pusher and everything it talks to.
//! Every wire union is a sealed enum; dispatch sites match on all variants so
//! an unknown tag is a decode failure, not a silently dropped frame.

mod client;
mod room;
mod space;

pub use client::*;
pub use room::*;
pub use space::*;

/// The buffer sizes for the channels used to multiplex streams inside the process.
pub const CHANNEL_BUFFER_SIZE: usize = 256;

/// WebSocket close code sent to a front client when its back-end is lost.
pub const CLOSE_BACK_LOST: u16 = 1011;
