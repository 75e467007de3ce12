//! Boundary to the network transport.
//!
//! The transport connects on construction, replicates the log and the
//! awareness state on its own, and reports what happens to the connection
//! as [`TransportEvent`]s over a `tokio::sync::mpsc` channel.

/// Connection state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Status(TransportStatus),
    /// The local log caught up with the remote state. Fires once per
    /// successful (re)sync.
    Synced,
}

pub trait Transport {
    /// Identifier of this physical connection.
    fn connection_id(&self) -> u64;

    /// Close the connection for good. Must be idempotent.
    ///
    /// By the time this is called the local awareness state has been
    /// cleared. The transport should send that tombstone
    /// ([`Awareness::encode_local`](crate::Awareness::encode_local)) before
    /// closing; otherwise peers only drop this participant once their own
    /// transport reports it gone.
    fn disconnect(&mut self);
}
