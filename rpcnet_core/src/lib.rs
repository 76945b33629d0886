//! `rpcnet_core`
//!
//! Shared protocol, crypto, and routing logic used by both the client and
//! server runtimes.
//!
//! Design goals:
//! - Deterministic and modular where practical.
//! - Clear separation of concerns (codec, session, transport, routing).
//! - Traits for abstraction and dependency injection.
//! - No `unsafe`.

pub mod auth;
pub mod codec;
pub mod config;
pub mod counters;
pub mod error;
pub mod event;
pub mod invoker;
pub mod message;
pub mod router;
pub mod session;
pub mod transport;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::auth::*;
    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::event::*;
    pub use crate::message::*;
    pub use crate::router::*;
    pub use crate::session::{PskCipher, SessionState};
    pub use crate::transport::*;
}
