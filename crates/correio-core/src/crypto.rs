use crate::error::TransportResult;

/// Seals and opens payload bytes. The transport treats both forms as opaque;
/// the cipher and its key management live behind this trait, wired in by the
/// container from the configured key material.
///
/// When no service is configured, a message marked for encryption fails fast
/// at send instead of silently leaving the process in plaintext.
pub trait EncryptionService: Send + Sync {
    fn encrypt(&self, plain: &[u8]) -> Vec<u8>;

    fn decrypt(&self, sealed: &[u8]) -> TransportResult<Vec<u8>>;
}
