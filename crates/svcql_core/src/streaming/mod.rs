//! Long running sources shared between streaming queries, and the windows
//! queries read from them.
pub mod key;
pub mod manager;
pub mod publisher;
pub mod window;

pub use key::StreamingKey;
pub use manager::WindowManager;
pub use publisher::WindowPublisher;
pub use window::{WindowConfig, WindowMode};
