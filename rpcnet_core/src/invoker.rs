//! Dispatch abstraction: maps an incoming `(interface_type, method_id)`
//! pair to application-supplied grain logic. Grain business logic itself is
//! out of scope; this module only defines the seam callers plug into.

use async_trait::async_trait;

use crate::message::GrainId;

/// Error surfaced by an [`Invoker`] implementation, distinct from
/// [`crate::error::RpcError`] so application errors can carry their own
/// payload for serialization into `Response::error_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    NotFound,
    Application(String),
}

/// One item delivered over an `AsyncEnumerableItem` stream.
pub enum StreamItem {
    Data(Vec<u8>),
    Complete,
    Error(String),
}

/// Application-supplied dispatch target. A server wraps one implementation
/// per grain type and the manifest maps interfaces to grain types to select
/// it.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Returns `true` if this invoker can handle `(grain_id, interface_type)`,
    /// without performing the call. Used to produce `MethodNotFound` before
    /// any argument deserialization.
    fn can_invoke(&self, grain_id: &GrainId, interface_type: &str, method_id: i32) -> bool;

    /// Invokes a unary method, returning the serialized result payload.
    async fn invoke(
        &self,
        grain_id: &GrainId,
        interface_type: &str,
        method_id: i32,
        arguments: &[u8],
    ) -> Result<Vec<u8>, InvokeError>;

    /// Invokes a streaming method. Implementations push items to `sender`
    /// until the stream completes, errors, or the caller cancels (detected
    /// by the sender's receiver having been dropped).
    async fn invoke_stream(
        &self,
        grain_id: &GrainId,
        interface_type: &str,
        method_id: i32,
        arguments: &[u8],
        sender: tokio::sync::mpsc::Sender<StreamItem>,
    ) -> Result<(), InvokeError>;
}
