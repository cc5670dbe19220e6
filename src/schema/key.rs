//! Public key types used to verify metadata signatures.

use crate::schema::decoded::{Decoded, Hex, RsaPem};
use crate::schema::error::{self, Result};
use crate::schema::spki;
use olpc_cjson::CanonicalFormatter;
use ring::digest::{digest, SHA256};
use ring::signature::{UnparsedPublicKey, ED25519, RSA_PSS_2048_8192_SHA256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_plain::{forward_display_to_serde, forward_from_str_to_serde};
use snafu::ResultExt;
use std::collections::HashMap;

/// A public key and its type. The private component never appears here; a `Key` carries
/// exactly what a client needs to verify signatures.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "keytype")]
pub enum Key {
    /// An Ed25519 key.
    #[serde(rename = "ed25519")]
    Ed25519 {
        /// The Ed25519 key material.
        keyval: Ed25519Key,
        /// Extra arguments found during deserialization, kept so that re-serialization
        /// reproduces the signed bytes.
        #[serde(flatten)]
        _extra: HashMap<String, Value>,
    },
    /// An RSA key.
    #[serde(rename = "rsa")]
    Rsa {
        /// The RSA key material.
        keyval: RsaKey,
        /// Extra arguments found during deserialization.
        #[serde(flatten)]
        _extra: HashMap<String, Value>,
    },
}

/// An Ed25519 public key, hex-encoded on the wire.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Ed25519Key {
    /// The public key bytes.
    pub public: Decoded<Hex>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

/// An RSA public key, PEM-encoded on the wire.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RsaKey {
    /// The public key DER, unwrapped from its PEM block.
    pub public: Decoded<RsaPem>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

/// The algorithm named by a signature. Methods a client does not implement must still
/// deserialize so the verification engine can classify them rather than reject the file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureMethod {
    /// Ed25519 over the canonical encoding of the payload.
    Ed25519,
    /// RSASSA-PSS with SHA-256 over the canonical encoding of the payload.
    RsassaPssSha256,
    /// A method this client does not implement.
    #[serde(untagged)]
    Unknown(String),
}

forward_display_to_serde!(SignatureMethod);
forward_from_str_to_serde!(SignatureMethod);

impl Key {
    /// Calculates the key ID: the SHA-256 digest of the key's canonical encoding. Key IDs
    /// are derived, never assigned.
    pub fn key_id(&self) -> Result<Decoded<Hex>> {
        let mut data = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut data, CanonicalFormatter::new());
        self.serialize(&mut ser)
            .context(error::JsonSerializationSnafu { what: "public key" })?;
        Ok(digest(&SHA256, &data).as_ref().to_vec().into())
    }

    /// Whether this key can check signatures made with `method`.
    pub(crate) fn supports(&self, method: &SignatureMethod) -> bool {
        matches!(
            (self, method),
            (Key::Ed25519 { .. }, SignatureMethod::Ed25519)
                | (Key::Rsa { .. }, SignatureMethod::RsassaPssSha256)
        )
    }

    /// Verifies `signature` over `msg`. Returns false for signatures that do not verify and
    /// for method/key-type mismatches.
    pub fn verify(&self, method: &SignatureMethod, msg: &[u8], signature: &[u8]) -> bool {
        match (self, method) {
            (Key::Ed25519 { keyval, .. }, SignatureMethod::Ed25519) => {
                UnparsedPublicKey::new(&ED25519, keyval.public.as_ref())
                    .verify(msg, signature)
                    .is_ok()
            }
            (Key::Rsa { keyval, .. }, SignatureMethod::RsassaPssSha256) => {
                match spki::rsa_public_key_der(keyval.public.as_ref()) {
                    Ok(der) => UnparsedPublicKey::new(&RSA_PSS_2048_8192_SHA256, &der)
                        .verify(msg, signature)
                        .is_ok(),
                    Err(_) => false,
                }
            }
            _ => false,
        }
    }
}
