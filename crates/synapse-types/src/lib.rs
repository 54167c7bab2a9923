//! Shared record types for the Synapse knowledge store.

mod conversation;
mod error;
mod solution;
mod tags;
pub mod timestamp;

pub use conversation::*;
pub use error::*;
pub use solution::*;
pub use tags::*;
