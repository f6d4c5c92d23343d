//! Creation and verification of recoverable (Ethereum-style) signatures.

use crate::types::{Address, Hash, Signature};
use k256::{
    ecdsa::{
        recoverable,
        signature::{hazmat::PrehashSigner, Signature as EcdsaSignature},
        SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
};
use sha3::{Digest, Keccak256};

pub use k256::ecdsa::Error;

/// Signs state digests on behalf of one participant identity.
///
/// Verification works by recovering the signer address from a signature and
/// comparing it against the expected participant, so no public keys have to
/// be exchanged beyond the addresses in the channel parameters.
#[derive(Clone)]
pub struct Signer {
    key: SigningKey,
    addr: Address,
}

// Never show the private key.
impl core::fmt::Debug for Signer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Signer").field("addr", &self.addr).finish()
    }
}

impl From<VerifyingKey> for Address {
    fn from(key: VerifyingKey) -> Self {
        // Convert the key into an EncodedPoint (on the curve), which has the
        // data we need in bytes [1..]. This panics if the bytes
        // representation of EncodedPoint is not 65 bytes, which is unlikely
        // to change in the dependency.
        let pk_bytes: [u8; 65] = key.to_encoded_point(false).as_bytes().try_into().unwrap();

        // Throw away the first byte, which is not part of the public key. It
        // is added by the uncompressed SEC1 encoding.
        let hash: [u8; 32] = Keccak256::digest(&pk_bytes[1..]).into();

        let mut addr = Address([0; 20]);
        addr.0.copy_from_slice(&hash[32 - 20..]);
        addr
    }
}

impl Signer {
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let key = SigningKey::random(rng);
        let addr = key.verifying_key().into();
        Self { key, addr }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, Error> {
        let key = SigningKey::from_bytes(bytes)?;
        let addr = key.verifying_key().into();
        Ok(Self { key, addr })
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    pub fn sign(&self, msg: Hash) -> Signature {
        let hash = eth_signed_msg_hash(msg);

        let sig: recoverable::Signature = self.key.sign_prehash(&hash.0).unwrap();

        // The recoverable signature already has the 65-byte r,s,v layout we
        // need, but v has to be offset by 27 to match the on-chain format.
        let mut sig_bytes: [u8; 65] = sig.as_bytes().try_into().expect(
            "signature size doesn't match, something big must have changed in the dependency",
        );
        debug_assert!(sig_bytes[32] & 0x80 == 0);
        sig_bytes[64] += 27;

        Signature(sig_bytes)
    }

    /// Recovers the address that produced `sig` over `msg`.
    pub fn recover_signer(&self, msg: Hash, sig: Signature) -> Result<Address, Error> {
        let hash = eth_signed_msg_hash(msg);

        // Undo adding the 27, to go back to the format expected below.
        let mut sig_bytes: [u8; 65] = sig.0;
        sig_bytes[64] = sig_bytes[64].wrapping_sub(27);

        let sig = recoverable::Signature::from_bytes(&sig_bytes)?;

        let verifying_key = sig.recover_verifying_key_from_digest_bytes(&hash.0.into())?;
        Ok(verifying_key.into())
    }
}

/// Add the `\x19Ethereum Signed Message\n<length>` prefix to hash.
fn eth_signed_msg_hash(hash: Hash) -> Hash {
    // Packed encoding, fed to the hasher directly.
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}
