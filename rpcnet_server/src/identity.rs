//! Maps the plaintext `client_id` sent in `HANDSHAKE_HELLO` to a
//! pre-shared key and the [`Identity`] attached to the connection once the
//! challenge succeeds. Real deployments back this with whatever account
//! store issues PSKs; tests and the demo binary use the static map below.

use std::collections::HashMap;

use rpcnet_core::message::Identity;

pub trait IdentityStore: Send + Sync {
    /// Looks up the pre-shared key and resulting identity for a client id.
    /// `None` means the listener should reject the connection outright.
    fn lookup(&self, client_id: &str) -> Option<(Vec<u8>, Identity)>;
}

/// A fixed, in-memory identity store, good enough for the demo binary and
/// for tests; production deployments implement [`IdentityStore`] against
/// their own account system instead.
#[derive(Default)]
pub struct StaticIdentityStore {
    entries: HashMap<String, (Vec<u8>, Identity)>,
}

impl StaticIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, client_id: impl Into<String>, psk: Vec<u8>, identity: Identity) -> &mut Self {
        self.entries.insert(client_id.into(), (psk, identity));
        self
    }
}

impl IdentityStore for StaticIdentityStore {
    fn lookup(&self, client_id: &str) -> Option<(Vec<u8>, Identity)> {
        self.entries.get(client_id).cloned()
    }
}
