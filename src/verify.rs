//! Threshold signature verification over signed metadata objects.
//!
//! Every signature on an object is classified exactly once, by key ID, into one of five
//! buckets. Only `good` counts toward a threshold: a signature that verifies
//! cryptographically but was made by a key the role does not authorize is `unauthorized`
//! and worth nothing.

use crate::error::{self, Result};
use crate::keydb::KeyDb;
use crate::schema::decoded::{Decoded, Hex};
use crate::schema::{Role, Signed};
use std::collections::HashSet;
use std::num::NonZeroU64;

/// The classification of every signature on one signed object, produced by
/// [`get_signature_status`].
#[derive(Debug, Clone, Default)]
pub(crate) struct SignatureStatus {
    /// Verified, and made by a key the role authorizes.
    pub(crate) good: Vec<Decoded<Hex>>,
    /// Made by a known, authorized-or-not key, but failed cryptographic verification.
    pub(crate) bad: Vec<Decoded<Hex>>,
    /// Made by a key ID the trust store does not know.
    pub(crate) unrecognized: Vec<Decoded<Hex>>,
    /// Verified, but made by a key the role does not authorize.
    pub(crate) unauthorized: Vec<Decoded<Hex>>,
    /// The signature method is one the key cannot perform or the client does not implement.
    pub(crate) unknown_method: Vec<Decoded<Hex>>,
    /// The role's threshold, when a role was named.
    pub(crate) threshold: Option<NonZeroU64>,
}

impl SignatureStatus {
    /// Whether the good signatures meet the role's threshold.
    ///
    /// # Panics
    ///
    /// Panics if the status was computed without naming a role; asking whether an
    /// un-thresholded status "is valid" is a programming error.
    pub(crate) fn is_valid(&self) -> bool {
        let threshold = self
            .threshold
            .expect("signature status computed without a role has no threshold");
        self.good.len() as u64 >= threshold.get()
    }
}

/// Classifies every signature on `signed` against the trust store. When `role` is given,
/// authorization and threshold are evaluated against that role; when it is `None`, only key
/// knowledge and cryptographic validity are evaluated.
///
/// Duplicate signatures by the same key ID are classified once.
pub(crate) fn get_signature_status<T: Role>(
    signed: &Signed<T>,
    keydb: &KeyDb,
    role: Option<&str>,
) -> Result<SignatureStatus> {
    let canonical = signed.signed.canonical_form()?;
    let authorized_keyids = role.and_then(|name| keydb.role(name)).map(|r| &r.keyids);

    let mut status = SignatureStatus {
        threshold: role.and_then(|name| keydb.role_threshold(name)),
        ..SignatureStatus::default()
    };

    let mut seen = HashSet::new();
    for signature in &signed.signatures {
        if !seen.insert(signature.keyid.clone()) {
            continue;
        }

        let Some(key) = keydb.key(&signature.keyid) else {
            status.unrecognized.push(signature.keyid.clone());
            continue;
        };

        if !key.supports(&signature.method) {
            status.unknown_method.push(signature.keyid.clone());
            continue;
        }

        if !key.verify(&signature.method, &canonical, &signature.sig) {
            status.bad.push(signature.keyid.clone());
            continue;
        }

        match authorized_keyids {
            Some(keyids) if !keyids.contains(&signature.keyid) => {
                status.unauthorized.push(signature.keyid.clone());
            }
            _ => status.good.push(signature.keyid.clone()),
        }
    }

    Ok(status)
}

/// Verifies that `signed` carries enough good signatures to meet `role`'s threshold.
pub(crate) fn check_signatures<T: Role>(
    signed: &Signed<T>,
    keydb: &KeyDb,
    role: &str,
) -> Result<()> {
    let status = get_signature_status(signed, keydb, Some(role))?;
    let threshold = status
        .threshold
        .map_or(u64::MAX, std::num::NonZeroU64::get);
    if status.threshold.is_none() || !status.is_valid() {
        return error::VerificationFailedSnafu {
            role,
            good: status.good.len(),
            threshold,
        }
        .fail();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::key::{Key, SignatureMethod};
    use crate::schema::{RoleKeys, Signature, Targets};
    use crate::sign::{parse_keypair, Sign};
    use ring::rand::SystemRandom;
    use ring::signature::Ed25519KeyPair;
    use std::collections::HashMap;
    use std::num::NonZeroU64;

    struct TestKey {
        keyid: Decoded<Hex>,
        signer: Box<dyn Sign>,
    }

    fn generate_key() -> TestKey {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let signer = parse_keypair(pkcs8.as_ref()).unwrap();
        let keyid = signer.public_key().key_id().unwrap();
        TestKey { keyid, signer }
    }

    fn empty_targets() -> Signed<Targets> {
        serde_json::from_value(serde_json::json!({
            "signed": {
                "_type": "targets",
                "ts": "2026-01-02T03:04:05Z",
                "expires": "2027-01-02T03:04:05Z",
                "targets": {}
            },
            "signatures": []
        }))
        .unwrap()
    }

    fn sign(signed: &mut Signed<Targets>, key: &TestKey) {
        let canonical = signed.signed.canonical_form().unwrap();
        let rng = SystemRandom::new();
        let sig = key.signer.sign(&canonical, &rng).unwrap();
        signed.add_signature(Signature {
            keyid: key.keyid.clone(),
            method: key.signer.method(),
            sig: sig.into(),
        });
    }

    fn keydb_for(keys: &[&TestKey], role: &str, threshold: u64) -> KeyDb {
        let mut db = KeyDb::default();
        for key in keys {
            db.add_key(key.keyid.clone(), key.signer.public_key())
                .unwrap();
        }
        db.add_role(
            role,
            RoleKeys {
                keyids: keys.iter().map(|k| k.keyid.clone()).collect(),
                threshold: NonZeroU64::new(threshold).unwrap(),
                paths: None,
                _extra: HashMap::new(),
            },
            false,
        )
        .unwrap();
        db
    }

    #[test]
    fn threshold_met() {
        let key = generate_key();
        let mut signed = empty_targets();
        sign(&mut signed, &key);

        let db = keydb_for(&[&key], "targets", 1);
        check_signatures(&signed, &db, "targets").unwrap();
    }

    #[test]
    fn threshold_requires_distinct_keys() {
        let key = generate_key();
        let mut signed = empty_targets();
        sign(&mut signed, &key);
        // A second signature by the same key is collapsed by add_signature; force a
        // duplicate by hand.
        let duplicate = signed.signatures[0].clone();
        signed.signatures.push(duplicate);

        let other = generate_key();
        let db = keydb_for(&[&key, &other], "targets", 2);
        let status = get_signature_status(&signed, &db, Some("targets")).unwrap();
        assert_eq!(status.good.len(), 1);
        assert!(!status.is_valid());
        assert!(check_signatures(&signed, &db, "targets").is_err());
    }

    #[test]
    fn tampered_payload_is_bad() {
        let key = generate_key();
        let mut signed = empty_targets();
        sign(&mut signed, &key);
        signed.signed.expires = "2030-01-01T00:00:00Z".parse().unwrap();

        let db = keydb_for(&[&key], "targets", 1);
        let status = get_signature_status(&signed, &db, Some("targets")).unwrap();
        assert_eq!(status.bad.len(), 1);
        assert!(status.good.is_empty());
    }

    #[test]
    fn unauthorized_key_does_not_count() {
        let authorized = generate_key();
        let interloper = generate_key();
        let mut signed = empty_targets();
        sign(&mut signed, &interloper);

        let mut db = keydb_for(&[&authorized], "targets", 1);
        db.add_key(interloper.keyid.clone(), interloper.signer.public_key())
            .unwrap();

        let status = get_signature_status(&signed, &db, Some("targets")).unwrap();
        assert_eq!(status.unauthorized.len(), 1);
        assert!(status.good.is_empty());
        assert!(!status.is_valid());
    }

    #[test]
    fn unknown_keyid_is_unrecognized() {
        let key = generate_key();
        let mut signed = empty_targets();
        sign(&mut signed, &key);

        let db = keydb_for(&[&generate_key()], "targets", 1);
        let status = get_signature_status(&signed, &db, Some("targets")).unwrap();
        assert_eq!(status.unrecognized.len(), 1);
    }

    #[test]
    fn method_key_cannot_perform_is_unknown_method() {
        let key = generate_key();
        let mut signed = empty_targets();
        sign(&mut signed, &key);
        signed.signatures[0].method = SignatureMethod::RsassaPssSha256;

        let db = keydb_for(&[&key], "targets", 1);
        let status = get_signature_status(&signed, &db, Some("targets")).unwrap();
        assert_eq!(status.unknown_method.len(), 1);
    }

    #[test]
    fn unnamed_method_is_unknown_method() {
        let key = generate_key();
        let mut signed = empty_targets();
        sign(&mut signed, &key);
        signed.signatures[0].method = SignatureMethod::Unknown("quantum-9000".to_owned());

        let db = keydb_for(&[&key], "targets", 1);
        let status = get_signature_status(&signed, &db, Some("targets")).unwrap();
        assert_eq!(status.unknown_method.len(), 1);
    }

    #[test]
    #[should_panic(expected = "without a role")]
    fn is_valid_without_role_panics() {
        let key = generate_key();
        let mut signed = empty_targets();
        sign(&mut signed, &key);

        let db = keydb_for(&[&key], "targets", 1);
        let status = get_signature_status(&signed, &db, None).unwrap();
        let _ = status.is_valid();
    }

    #[test]
    fn status_without_role_still_classifies() {
        let key = generate_key();
        let mut signed = empty_targets();
        sign(&mut signed, &key);

        let db = keydb_for(&[&key], "targets", 1);
        let status = get_signature_status(&signed, &db, None).unwrap();
        assert_eq!(status.good.len(), 1);
        assert!(status.threshold.is_none());
    }
}
