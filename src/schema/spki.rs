//! Minimal DER handling for RSA public keys.
//!
//! `ring` verifies RSASSA-PSS signatures against a PKCS#1 `RSAPublicKey` structure, while
//! keys in repository metadata are typically PEM blocks containing a SubjectPublicKeyInfo.
//! This module unwraps the SPKI framing (and passes PKCS#1 input through unchanged) without
//! pulling in a full ASN.1 stack.

use crate::schema::error::{self, Result};
use snafu::ensure;

const TAG_SEQUENCE: u8 = 0x30;
const TAG_BIT_STRING: u8 = 0x03;

/// Reads one TLV element with the expected tag, returning its contents and the remainder of
/// the input after the element.
fn read_tlv(input: &[u8], tag: u8) -> Result<(&[u8], &[u8])> {
    ensure!(
        input.len() >= 2,
        error::InvalidPublicKeySnafu {
            reason: "truncated DER element"
        }
    );
    ensure!(
        input[0] == tag,
        error::InvalidPublicKeySnafu {
            reason: "unexpected DER tag"
        }
    );

    let (len, header) = match input[1] {
        n if n < 0x80 => (n as usize, 2),
        0x81 => {
            ensure!(
                input.len() >= 3,
                error::InvalidPublicKeySnafu {
                    reason: "truncated DER length"
                }
            );
            (input[2] as usize, 3)
        }
        0x82 => {
            ensure!(
                input.len() >= 4,
                error::InvalidPublicKeySnafu {
                    reason: "truncated DER length"
                }
            );
            (usize::from(input[2]) << 8 | usize::from(input[3]), 4)
        }
        _ => {
            return error::InvalidPublicKeySnafu {
                reason: "unsupported DER length form",
            }
            .fail()
        }
    };

    ensure!(
        input.len() >= header + len,
        error::InvalidPublicKeySnafu {
            reason: "DER element longer than input"
        }
    );
    Ok((&input[header..header + len], &input[header + len..]))
}

/// Returns the PKCS#1 `RSAPublicKey` DER for the given key material, which may be either a
/// SubjectPublicKeyInfo or already-raw PKCS#1.
pub(super) fn rsa_public_key_der(der: &[u8]) -> Result<Vec<u8>> {
    let (outer, _) = read_tlv(der, TAG_SEQUENCE)?;

    // PKCS#1 is SEQUENCE { INTEGER, INTEGER }; SPKI is SEQUENCE { SEQUENCE, BIT STRING }.
    if outer.first() != Some(&TAG_SEQUENCE) {
        return Ok(der.to_vec());
    }

    let (_algorithm, rest) = read_tlv(outer, TAG_SEQUENCE)?;
    let (bits, _) = read_tlv(rest, TAG_BIT_STRING)?;
    ensure!(
        bits.first() == Some(&0),
        error::InvalidPublicKeySnafu {
            reason: "BIT STRING with unused bits"
        }
    );
    Ok(bits[1..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::rsa_public_key_der;

    // SEQUENCE { INTEGER 5, INTEGER 3 }, a stand-in for PKCS#1 structure.
    const PKCS1: &[u8] = &[0x30, 0x06, 0x02, 0x01, 0x05, 0x02, 0x01, 0x03];

    #[test]
    fn pkcs1_passthrough() {
        assert_eq!(rsa_public_key_der(PKCS1).unwrap(), PKCS1);
    }

    #[test]
    fn spki_unwrapped() {
        // SEQUENCE { SEQUENCE {}, BIT STRING { 0x00, PKCS1 } }
        let mut spki = vec![0x30, 0x0d, 0x30, 0x00, 0x03, 0x09, 0x00];
        spki.extend_from_slice(PKCS1);
        assert_eq!(rsa_public_key_der(&spki).unwrap(), PKCS1);
    }

    #[test]
    fn garbage_rejected() {
        assert!(rsa_public_key_der(&[0x02, 0x01, 0x00]).is_err());
        assert!(rsa_public_key_der(&[0x30]).is_err());
    }
}
