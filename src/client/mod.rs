//! Client-side session engine (§4.7): state machine, in-flight window,
//! event→request mapping, rewind-on-error.

mod session;

pub use session::{ClientSession, SessionState};
