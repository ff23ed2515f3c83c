//! Umbrella crate; see `fixlink-core` and `fixlink-session`.

pub use fixlink_core::{codec, fields, message};

#[cfg(feature = "session")]
pub use fixlink_session as session;
