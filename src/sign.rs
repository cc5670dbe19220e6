//! Signing support for producing metadata, the mirror image of the verification engine.

use crate::error::{self, Result};
use crate::schema::key::{Ed25519Key, Key, RsaKey, SignatureMethod};
use ring::rand::SecureRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, RsaKeyPair};
use snafu::ResultExt;
use std::collections::HashMap;

/// This trait must be implemented for each type of key with which you will sign things.
pub trait Sign: Sync + Send {
    /// Returns the public half of this keypair as a [`Key`].
    fn public_key(&self) -> Key;

    /// The signature method this key signs with.
    fn method(&self) -> SignatureMethod;

    /// Signs the supplied message.
    fn sign(&self, msg: &[u8], rng: &dyn SecureRandom) -> Result<Vec<u8>>;
}

impl Sign for Ed25519KeyPair {
    fn public_key(&self) -> Key {
        Key::Ed25519 {
            keyval: Ed25519Key {
                public: KeyPair::public_key(self).as_ref().to_vec().into(),
                _extra: HashMap::new(),
            },
            _extra: HashMap::new(),
        }
    }

    fn method(&self) -> SignatureMethod {
        SignatureMethod::Ed25519
    }

    fn sign(&self, msg: &[u8], _rng: &dyn SecureRandom) -> Result<Vec<u8>> {
        Ok(Ed25519KeyPair::sign(self, msg).as_ref().to_vec())
    }
}

impl Sign for RsaKeyPair {
    fn public_key(&self) -> Key {
        Key::Rsa {
            keyval: RsaKey {
                public: KeyPair::public_key(self).as_ref().to_vec().into(),
                _extra: HashMap::new(),
            },
            _extra: HashMap::new(),
        }
    }

    fn method(&self) -> SignatureMethod {
        SignatureMethod::RsassaPssSha256
    }

    fn sign(&self, msg: &[u8], rng: &dyn SecureRandom) -> Result<Vec<u8>> {
        let mut signature = vec![0; self.public().modulus_len()];
        RsaKeyPair::sign(self, &ring::signature::RSA_PSS_SHA256, rng, msg, &mut signature)
            .context(error::SignSnafu)?;
        Ok(signature)
    }
}

/// Parses a supplied keypair and if it is recognized, returns an object that implements the
/// `Sign` trait. Accepts PKCS#8 (`PRIVATE KEY`, Ed25519 or RSA) and PKCS#1
/// (`RSA PRIVATE KEY`) PEM blocks, or raw PKCS#8 DER.
pub fn parse_keypair(key: &[u8]) -> Result<Box<dyn Sign>> {
    if let Ok(pem) = pem::parse(key) {
        match pem.tag() {
            "PRIVATE KEY" => {
                if let Ok(ed25519) = Ed25519KeyPair::from_pkcs8(pem.contents()) {
                    Ok(Box::new(ed25519))
                } else if let Ok(rsa) = RsaKeyPair::from_pkcs8(pem.contents()) {
                    Ok(Box::new(rsa))
                } else {
                    error::KeyUnrecognizedSnafu.fail()
                }
            }
            "RSA PRIVATE KEY" => Ok(Box::new(
                RsaKeyPair::from_der(pem.contents()).context(error::KeyRejectedSnafu)?,
            )),
            _ => error::KeyUnrecognizedSnafu.fail(),
        }
    } else if let Ok(ed25519) = Ed25519KeyPair::from_pkcs8(key) {
        Ok(Box::new(ed25519))
    } else {
        error::KeyUnrecognizedSnafu.fail()
    }
}
