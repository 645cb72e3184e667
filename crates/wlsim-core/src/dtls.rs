//! DTLS session seam.
//!
//! The core never links a TLS library directly. A [`DtlsConnector`] hands
//! each AP its own boxed [`DtlsSession`], which the AP owns outright. Input
//! ciphertext is pushed in with [`DtlsSession::feed`] and output ciphertext
//! is pulled with [`DtlsSession::drain`] after every operation, so no
//! library callback ever needs to find its way back to an AP.

use std::time::Duration;

use bytes::Bytes;

use crate::error::CoreError;
use crate::model::MacAddress;

/// Lower bound on the handshake retransmit wait.
pub const MIN_HANDSHAKE_WAIT: Duration = Duration::from_millis(300);
/// Upper bound on the handshake retransmit wait.
pub const MAX_HANDSHAKE_WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStatus {
    Finished,
    /// Waiting on the peer; call again after feeding input or on timeout.
    InProgress,
    /// The peer sent a fatal alert.
    Alert(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStatus {
    /// Close-notify exchanged in both directions.
    Complete,
    /// Close-notify sent, peer's not seen yet.
    InProgress,
}

/// One client-side DTLS session with memory-buffer I/O.
pub trait DtlsSession: Send {
    fn do_handshake(&mut self) -> Result<HandshakeStatus, CoreError>;

    /// Retransmit timer fired with no input; resend the last flight.
    fn handle_timeout(&mut self);

    /// The library's recommended wait before `handle_timeout`.
    fn timeout(&self) -> Option<Duration>;

    fn is_handshake_finished(&self) -> bool;

    fn is_shutdown(&self) -> bool;

    /// Queue a received record for the next handshake step or read.
    fn feed(&mut self, record: &[u8]);

    /// Take every ciphertext record produced so far.
    fn drain(&mut self) -> Vec<Bytes>;

    /// Encrypt application data; the records appear in `drain`.
    fn write(&mut self, plaintext: &[u8]) -> Result<(), CoreError>;

    /// Decrypt the next fed record, if it held application data.
    fn read(&mut self) -> Result<Option<Bytes>, CoreError>;

    fn shutdown(&mut self) -> Result<ShutdownStatus, CoreError>;
}

/// Shared context producing sessions; the `SSL_CTX` of a TLS library.
pub trait DtlsConnector: Send + Sync {
    fn new_session(&self, ap: MacAddress) -> Box<dyn DtlsSession>;
}

/// Clamp the library's suggestion to the handshake wait bounds.
pub fn handshake_wait(suggested: Option<Duration>) -> Duration {
    suggested
        .unwrap_or(Duration::ZERO)
        .clamp(MIN_HANDSHAKE_WAIT, MAX_HANDSHAKE_WAIT)
}
