//! Epoll-driven I/O reactor.
//!
//! - [`core`]: the [`IoManager`], a scheduler whose idle workers wait for readiness
//! - [`event`]: the READ/WRITE interest set
//! - `poller`: epoll instance and wake-up eventfd

pub mod core;
pub mod event;
pub(crate) mod poller;

pub use self::core::{EventCallback, IoManager};
pub use self::event::Event;
