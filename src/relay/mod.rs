pub mod coordinator;
pub mod message;

pub use coordinator::{Coordinator, RelayHandle};
pub use message::{Direction, Platform, RelayMessage};
