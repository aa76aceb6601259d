//! Common utilities and types shared across the application.

pub mod clock;
pub mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{AppError, BridgeError, ConfigError, FrameError, StorageError, UpdateError};
