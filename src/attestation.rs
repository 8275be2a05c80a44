use anyhow::{Context, Result};
use ciborium::Value as CborValue;
use sha2::{Digest, Sha256};

/// Model identifier baked into every attested credential
/// (`4d41190c-7beb-4a84-8018-adf265a6352d`).
pub const AAGUID: [u8; 16] = [
    0x4D, 0x41, 0x19, 0x0C, 0x7B, 0xEB, 0x4A, 0x84, 0x80, 0x18, 0xAD, 0xF2, 0x65, 0xA6, 0x35,
    0x2D,
];

/// UP | UV | AT: user present, user verified, attested credential data follows.
pub const FLAGS_ATTESTED: u8 = 0x45;

/// UP | UV: assertion without attested credential data.
pub const FLAGS_ASSERTION: u8 = 0x05;

pub fn rp_id_hash(rp_id: &str) -> [u8; 32] {
    Sha256::digest(rp_id.as_bytes()).into()
}

/// authenticator-data byte string for a registration:
/// `rpIdHash(32) || flags(1) || signCount(4) || aaguid(16) ||
///  credIdLen(2 BE) || credId || coseKey`.
///
/// The signature counter is transmitted as zero.
pub fn registration_auth_data(rp_id: &str, cred_id: &[u8], cose_key: &[u8]) -> Vec<u8> {
    let mut auth_data = Vec::with_capacity(55 + cred_id.len() + cose_key.len());
    auth_data.extend_from_slice(&rp_id_hash(rp_id));
    auth_data.push(FLAGS_ATTESTED);
    auth_data.extend_from_slice(&0u32.to_be_bytes());
    auth_data.extend_from_slice(&AAGUID);
    auth_data.extend_from_slice(&(cred_id.len() as u16).to_be_bytes());
    auth_data.extend_from_slice(cred_id);
    auth_data.extend_from_slice(cose_key);
    auth_data
}

/// authenticator-data byte string for an assertion: `rpIdHash || flags ||
/// signCount`, 37 bytes.
pub fn assertion_auth_data(rp_id: &str) -> Vec<u8> {
    let mut auth_data = Vec::with_capacity(37);
    auth_data.extend_from_slice(&rp_id_hash(rp_id));
    auth_data.push(FLAGS_ASSERTION);
    auth_data.extend_from_slice(&0u32.to_be_bytes());
    auth_data
}

/// Packed self-attestation object: `{1: "packed", 2: authData,
/// 3: {"alg": alg, "sig": sig}}`.
pub fn attestation_object(algorithm: i64, auth_data: Vec<u8>, signature: Vec<u8>) -> CborValue {
    let att_stmt = CborValue::Map(vec![
        (
            CborValue::Text("alg".to_string()),
            CborValue::Integer(algorithm.into()),
        ),
        (
            CborValue::Text("sig".to_string()),
            CborValue::Bytes(signature),
        ),
    ]);
    CborValue::Map(vec![
        (
            CborValue::Integer(1.into()),
            CborValue::Text("packed".to_string()),
        ),
        (CborValue::Integer(2.into()), CborValue::Bytes(auth_data)),
        (CborValue::Integer(3.into()), att_stmt),
    ])
}

/// Encode a value as deterministic CBOR: every map sorted by the canonical
/// key order (encoded length first, then bytewise), integers in shortest
/// form, definite lengths throughout.
pub fn canonical_bytes(value: &CborValue) -> Result<Vec<u8>> {
    let mut sorted = value.clone();
    sort_maps(&mut sorted);
    let mut encoded = Vec::new();
    ciborium::into_writer(&sorted, &mut encoded).context("failed to encode CBOR response")?;
    Ok(encoded)
}

fn sort_maps(value: &mut CborValue) {
    match value {
        CborValue::Map(pairs) => {
            for (_, nested) in pairs.iter_mut() {
                sort_maps(nested);
            }
            pairs.sort_by_cached_key(|(key, _)| {
                let mut encoded = Vec::new();
                if ciborium::into_writer(key, &mut encoded).is_err() {
                    log::error!("unencodable CBOR map key: {:?}", key);
                }
                (encoded.len(), encoded)
            });
        }
        CborValue::Array(items) => {
            for item in items.iter_mut() {
                sort_maps(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn registration_auth_data_layout() {
        let cred_id = b"0123456789abcdef_cryptane";
        let cose_key = [0xEE; 10];
        let auth_data = registration_auth_data("example.com", cred_id, &cose_key);

        assert_eq!(&auth_data[..32], &rp_id_hash("example.com"));
        assert_eq!(auth_data[32], 0x45);
        assert_eq!(&auth_data[33..37], &[0, 0, 0, 0]);
        assert_eq!(&auth_data[37..53], &AAGUID);
        assert_eq!(&auth_data[53..55], &[0x00, 25]);
        assert_eq!(&auth_data[55..80], cred_id);
        assert_eq!(&auth_data[80..], &cose_key);
    }

    #[test]
    fn assertion_auth_data_is_37_bytes() {
        let auth_data = assertion_auth_data("example.com");
        assert_eq!(auth_data.len(), 37);
        assert_eq!(auth_data[32], 0x05);
        assert_eq!(&auth_data[33..], &[0, 0, 0, 0]);
    }

    #[test]
    fn rp_id_hash_is_sha256() {
        assert_eq!(
            rp_id_hash("example.com"),
            hex!("a379a6f6eeafb9a55e378c118034e2751e682fab9f2d30ab13d2125586ce1947")
        );
    }

    #[test]
    fn attestation_object_keys_and_statement() {
        let object = attestation_object(-7, vec![1, 2, 3], vec![9, 9]);
        let encoded = canonical_bytes(&object).unwrap();
        let decoded: CborValue = ciborium::from_reader(encoded.as_slice()).unwrap();
        let pairs = decoded.into_map().unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].0, CborValue::Integer(1.into()));
        assert_eq!(pairs[0].1, CborValue::Text("packed".to_string()));
        assert_eq!(pairs[1].1, CborValue::Bytes(vec![1, 2, 3]));
        let att_stmt = pairs[2].1.clone().into_map().unwrap();
        assert_eq!(att_stmt[0].0, CborValue::Text("alg".to_string()));
        assert_eq!(att_stmt[0].1, CborValue::Integer((-7).into()));
        assert_eq!(att_stmt[1].0, CborValue::Text("sig".to_string()));
    }

    #[test]
    fn canonical_bytes_sorts_map_keys() {
        // Deliberately scrambled key order: text, negative, large positive,
        // small positive.
        let value = CborValue::Map(vec![
            (
                CborValue::Text("zz".to_string()),
                CborValue::Integer(0.into()),
            ),
            (
                CborValue::Integer((-1).into()),
                CborValue::Integer(0.into()),
            ),
            (
                CborValue::Integer(100.into()),
                CborValue::Integer(0.into()),
            ),
            (CborValue::Integer(2.into()), CborValue::Integer(0.into())),
        ]);
        let encoded = canonical_bytes(&value).unwrap();
        // 0xA4 map(4), then keys in canonical order: 0x02, 0x20 (-1),
        // 0x18 0x64 (100), 0x62 "zz".
        assert_eq!(encoded[0], 0xA4);
        assert_eq!(encoded[1], 0x02);
        assert_eq!(encoded[3], 0x20);
        assert_eq!(&encoded[5..7], &[0x18, 0x64]);
        assert_eq!(encoded[8], 0x62);
    }
}
