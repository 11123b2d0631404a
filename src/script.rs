//! Unlocking scripts, address derivation and ECDSA verification
//!
//! An unlocking script is `L(DER signature) ‖ L(compressed public key)`.
//! The address owning an output is the hex of RIPEMD-160(SHA-256(pubkey)),
//! so an input is authorized when its script's public key hashes to the
//! spent output's address and the signature verifies over the
//! transaction's signature message.

use crate::codec::{sha256, signature_message, Decoder, Encoder};
use crate::error::{ConsensusError, Result};
use crate::transaction::rehash;
use crate::types::*;
use ripemd::{Digest, Ripemd160};
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};

/// Build an unlocking script from a DER signature and a serialized public key
pub fn encode_unlocking_script(signature_der: &[u8], public_key: &[u8]) -> ByteString {
    let mut enc = Encoder::new();
    enc.put_bytes(signature_der).put_bytes(public_key);
    enc.into_bytes()
}

/// Split an unlocking script into (signature, public key)
pub fn decode_unlocking_script(script: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut dec = Decoder::new(script);
    let signature = dec.get_bytes()?.to_vec();
    let public_key = dec.get_bytes()?.to_vec();
    dec.finish()?;
    Ok((signature, public_key))
}

/// HASH160 of the public key, hex encoded
pub fn address_from_public_key(public_key: &[u8]) -> Address {
    let sha = sha256(public_key);
    let ripemd = Ripemd160::digest(sha);
    hex::encode(ripemd)
}

/// Verify that `script` authorizes spending an output owned by `address`
/// for a transaction whose signature message is `message`.
pub fn verify_script(script: &[u8], address: &str, message: &Hash) -> Result<()> {
    let (signature_bytes, public_key_bytes) = decode_unlocking_script(script)?;

    if address_from_public_key(&public_key_bytes) != address {
        return Err(ConsensusError::SignatureInvalid(format!(
            "public key does not hash to address {}",
            address
        )));
    }

    let public_key = PublicKey::from_slice(&public_key_bytes)
        .map_err(|e| ConsensusError::SignatureInvalid(format!("invalid public key: {}", e)))?;
    let signature = Signature::from_der(&signature_bytes)
        .map_err(|e| ConsensusError::SignatureInvalid(format!("invalid DER signature: {}", e)))?;
    let message = Message::from_digest_slice(message)
        .map_err(|e| ConsensusError::SignatureInvalid(e.to_string()))?;

    let secp = Secp256k1::verification_only();
    secp.verify_ecdsa(&message, &signature, &public_key)
        .map_err(|_| ConsensusError::SignatureInvalid("signature does not verify".into()))
}

/// A key pair able to sign the inputs it owns
#[derive(Debug, Clone)]
pub struct Account {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl Account {
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self> {
        let secret_key = SecretKey::from_slice(secret)
            .map_err(|e| ConsensusError::SignatureInvalid(format!("invalid secret key: {}", e)))?;
        let secp = Secp256k1::signing_only();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Ok(Self { secret_key, public_key })
    }

    pub fn public_key_bytes(&self) -> [u8; 33] {
        self.public_key.serialize()
    }

    pub fn address(&self) -> Address {
        address_from_public_key(&self.public_key_bytes())
    }

    /// Unlocking script over `message`
    pub fn unlocking_script(&self, message: &Hash) -> Result<ByteString> {
        let message = Message::from_digest_slice(message)
            .map_err(|e| ConsensusError::SignatureInvalid(e.to_string()))?;
        let secp = Secp256k1::signing_only();
        let signature = secp.sign_ecdsa(&message, &self.secret_key);
        Ok(encode_unlocking_script(&signature.serialize_der(), &self.public_key_bytes()))
    }

    /// Sign every input with this account and recompute the hashes
    pub fn sign_transaction(&self, tx: &mut Transaction) -> Result<()> {
        let script = self.unlocking_script(&signature_message(tx))?;
        for input in &mut tx.inputs {
            input.script = script.clone();
        }
        rehash(tx);
        Ok(())
    }
}
