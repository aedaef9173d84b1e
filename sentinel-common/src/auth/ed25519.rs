use super::Authenticator;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

pub struct Ed25519Authenticator {
    keypair: SigningKey,
}

impl Ed25519Authenticator {
    pub fn new(keypair: SigningKey) -> Self {
        Self { keypair }
    }

    /// Fresh keypair from the OS random source.
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Self::new(SigningKey::generate(&mut csprng))
    }
}

impl Authenticator for Ed25519Authenticator {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, String> {
        let signature = self.keypair.sign(message);
        Ok(signature.to_vec())
    }

    fn public_key(&self) -> Vec<u8> {
        self.keypair.verifying_key().to_bytes().to_vec()
    }
}

/// Verifies `signature` over `message` with a raw 32-byte Ed25519 public key.
///
/// Malformed keys or signatures are errors; a well-formed signature that does
/// not match is `Ok(false)`.
pub fn verify_detached(message: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool, String> {
    let key_bytes: &[u8; 32] = public_key.try_into().map_err(|_| "Invalid public key length")?;
    let verifying_key = VerifyingKey::from_bytes(key_bytes).map_err(|e| e.to_string())?;
    let signature = Signature::from_slice(signature).map_err(|e| e.to_string())?;

    Ok(verifying_key.verify(message, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ed25519_signing_and_verification() {
        let auth = Ed25519Authenticator::generate();

        let message = b"hello world";
        let signature = auth.sign(message).expect("Signing failed");
        assert_eq!(signature.len(), 64);

        let public_key = auth.public_key();
        assert!(verify_detached(message, &signature, &public_key).expect("Verification failed"));
        assert!(!verify_detached(b"wrong message", &signature, &public_key).expect("Verification failed"));
    }

    #[test]
    fn test_signature_from_another_key_is_rejected() {
        let signer = Ed25519Authenticator::generate();
        let other = Ed25519Authenticator::generate();
        let signature = signer.sign(b"digest").unwrap();

        assert!(verify_detached(b"digest", &signature, &signer.public_key()).unwrap());
        assert!(!verify_detached(b"digest", &signature, &other.public_key()).unwrap());
    }

    #[test]
    fn test_malformed_inputs_are_errors() {
        let auth = Ed25519Authenticator::generate();
        assert!(verify_detached(b"m", &[0u8; 10], &auth.public_key()).is_err());
        assert!(verify_detached(b"m", &[0u8; 64], &[1u8; 5]).is_err());
    }
}
