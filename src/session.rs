//! The per-download engine.
//!
//! One spawned task owns all mutable download state: connections,
//! picker, choker, assembler, and tracker schedule. Peer sockets live on
//! their own reader and writer tasks and talk to the engine over
//! channels, so every state mutation happens on the engine task and no
//! lock is held across the protocol logic. Upload block reads go through
//! short-lived serve tasks that can sleep on the rate limiter without
//! stalling anything else.

mod engine;
mod error;
mod event;
mod io;


pub use engine::Session;
pub use error::SessionError;
pub use event::{SessionCommand, SessionEvent};
