//! Task event types and the broadcast bus that carries them.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
