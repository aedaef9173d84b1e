pub mod ed25519;

/// Signing seam used by the consensus engine.
///
/// Messages are always signed over their digest bytes, never over the full
/// envelope, so timestamp and signature stay outside the signed content.
pub trait Authenticator: Send + Sync {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, String>;
    fn public_key(&self) -> Vec<u8>;
}
