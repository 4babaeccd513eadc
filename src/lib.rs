// An embeddable SIP user agent in Rust
pub type Result<T> = std::result::Result<T, crate::error::Error>;
pub use crate::error::Error;
pub mod config;
pub mod dialog;
pub mod error;
pub mod media;
pub mod sdp;
pub mod transaction;
pub mod transport;
pub mod useragent;
pub use useragent::{UserAgent, UserAgentBuilder};
