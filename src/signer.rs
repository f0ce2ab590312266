//! The digest-signing seam between the admission pipeline and key material.
//!
//! The pipeline only ever needs one primitive: sign an already-computed
//! 32-byte EIP-712 digest and get back a 65-byte recoverable signature. The
//! trait keeps key handling swappable (local key, KMS, test double) without
//! the pipeline knowing.

use alloy_primitives::{Address, B256};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;

use crate::types::EvmSignature;

#[derive(Debug, thiserror::Error)]
#[error("Signing failed: {0}")]
pub struct SigningError(#[from] alloy_signer::Error);

/// Signs raw 32-byte digests. No message prefix is applied; the digest is
/// already the EIP-712 result.
pub trait DigestSigner: Send + Sync {
    /// The address whose key produces the signatures.
    fn signer_address(&self) -> Address;

    /// Produces an `(r, s, v)` recoverable signature over `digest`.
    fn sign_digest(
        &self,
        digest: B256,
    ) -> impl Future<Output = Result<EvmSignature, SigningError>> + Send;
}

impl DigestSigner for PrivateKeySigner {
    fn signer_address(&self) -> Address {
        self.address()
    }

    async fn sign_digest(&self, digest: B256) -> Result<EvmSignature, SigningError> {
        let signature = self.sign_hash(&digest).await?;
        Ok(EvmSignature(signature.as_bytes()))
    }
}
