use std::time::{Duration, Instant};

use ciborium::Value as CborValue;

use crate::attestation;
use crate::crypto::Algorithm;
use crate::store::{CredentialRecord, CredentialStore};

/// CTAP2 command codes.
pub const CTAP2_MAKE_CREDENTIAL: u8 = 0x01;
pub const CTAP2_GET_ASSERTION: u8 = 0x02;
pub const CTAP2_GET_INFO: u8 = 0x04;
pub const CTAP2_RESET: u8 = 0x07;
pub const CTAP2_GET_NEXT_ASSERTION: u8 = 0x08;

/// CTAP2 status codes surfaced as the first response byte.
pub const CTAP2_OK: u8 = 0x00;
pub const CTAP2_ERR_INVALID_COMMAND: u8 = 0x01;
pub const CTAP2_ERR_CREDENTIAL_EXCLUDED: u8 = 0x19;
pub const CTAP2_ERR_KEEPALIVE_CANCEL: u8 = 0x2D;
pub const CTAP2_ERR_NO_CREDENTIALS: u8 = 0x2E;
pub const CTAP2_ERR_NOT_ALLOWED: u8 = 0x30;
pub const CTAP2_ERR_OTHER: u8 = 0x7F;

/// GetNextAssertion must follow within this window.
pub const CURSOR_TTL: Duration = Duration::from_secs(30);

/// Credential IDs are 16 random bytes plus this suffix; relying parties
/// hold these bytes verbatim, so the layout can never change.
const CRED_ID_SUFFIX: &[u8] = b"_cryptane";

/// A command's hook into the user-presence machinery. Blocks until the
/// button is pressed (`true`) or the transaction is cancelled (`false`).
pub trait PresenceCheck {
    fn request(&self) -> bool;
}

impl<F: Fn() -> bool> PresenceCheck for F {
    fn request(&self) -> bool {
        self()
    }
}

struct AssertionCursor {
    assertions: Vec<CborValue>,
    index: usize,
    refreshed_at: Instant,
}

/// The CTAP2 state machine: credential store, assertion cursor and the
/// algorithm most recently used for signing.
pub struct Authenticator {
    pub(crate) store: CredentialStore,
    cursor: Option<AssertionCursor>,
    last_algo: i64,
}

type CommandResult = Result<Option<CborValue>, u8>;

impl Authenticator {
    pub fn new(store: CredentialStore) -> Self {
        Authenticator {
            store,
            cursor: None,
            last_algo: Algorithm::EcdsaP256.cose_alg(),
        }
    }

    /// COSE identifier of the last signing algorithm used, for the
    /// benchmark log.
    pub fn last_algo(&self) -> i64 {
        self.last_algo
    }

    /// Execute one CTAPHID_CBOR payload: command byte followed by a CBOR
    /// map. Returns status byte plus, on success, the canonically encoded
    /// response map.
    pub fn handle_cbor(&mut self, payload: &[u8], presence: &dyn PresenceCheck) -> Vec<u8> {
        let Some((&cmd, body)) = payload.split_first() else {
            log::warn!("empty CBOR payload");
            return vec![CTAP2_ERR_OTHER];
        };

        log::debug!("CTAP2 command 0x{:02X}, {} body byte(s)", cmd, body.len());
        let result = match cmd {
            CTAP2_GET_INFO => self.get_info(),
            CTAP2_MAKE_CREDENTIAL => self.make_credential(body, presence),
            CTAP2_GET_ASSERTION => self.get_assertion(body, presence),
            CTAP2_GET_NEXT_ASSERTION => self.get_next_assertion(),
            CTAP2_RESET => self.reset(presence),
            other => {
                log::warn!("unsupported CTAP2 command 0x{:02X}", other);
                Err(CTAP2_ERR_INVALID_COMMAND)
            }
        };

        match result {
            Ok(Some(value)) => match attestation::canonical_bytes(&value) {
                Ok(body) => {
                    let mut reply = Vec::with_capacity(1 + body.len());
                    reply.push(CTAP2_OK);
                    reply.extend_from_slice(&body);
                    reply
                }
                Err(e) => {
                    log::error!("failed to encode CTAP2 response: {:#}", e);
                    vec![CTAP2_ERR_OTHER]
                }
            },
            Ok(None) => vec![CTAP2_OK],
            Err(status) => {
                log::debug!("CTAP2 command 0x{:02X} -> status 0x{:02X}", cmd, status);
                vec![status]
            }
        }
    }

    fn get_info(&mut self) -> CommandResult {
        let alg_entry = |alg: i64| {
            CborValue::Map(vec![
                (
                    CborValue::Text("alg".to_string()),
                    CborValue::Integer(alg.into()),
                ),
                (
                    CborValue::Text("type".to_string()),
                    CborValue::Text("public-key".to_string()),
                ),
            ])
        };
        let options = CborValue::Map(vec![
            (CborValue::Text("rk".to_string()), CborValue::Bool(true)),
            (CborValue::Text("up".to_string()), CborValue::Bool(true)),
            (CborValue::Text("uv".to_string()), CborValue::Bool(true)),
            (CborValue::Text("plat".to_string()), CborValue::Bool(false)),
        ]);

        Ok(Some(CborValue::Map(vec![
            (
                CborValue::Integer(1.into()),
                CborValue::Array(vec![
                    CborValue::Text("FIDO_2_0".to_string()),
                    CborValue::Text("FIDO_2_1_PRE".to_string()),
                ]),
            ),
            (
                CborValue::Integer(2.into()),
                CborValue::Array(vec![CborValue::Text("credProtect".to_string())]),
            ),
            (
                CborValue::Integer(3.into()),
                CborValue::Bytes(attestation::AAGUID.to_vec()),
            ),
            (CborValue::Integer(4.into()), options),
            (
                CborValue::Integer(5.into()),
                CborValue::Integer(1200.into()),
            ), // maxMsgSize
            (
                CborValue::Integer(6.into()),
                CborValue::Array(vec![CborValue::Integer(1.into())]),
            ), // pinUvAuthProtocols
            (CborValue::Integer(7.into()), CborValue::Integer(8.into())), // maxCredentialCountInList
            (
                CborValue::Integer(8.into()),
                CborValue::Integer(128.into()),
            ), // maxCredentialIdLength
            (
                CborValue::Integer(9.into()),
                CborValue::Array(vec![CborValue::Text("usb".to_string())]),
            ),
            (
                CborValue::Integer(10.into()),
                CborValue::Array(vec![alg_entry(-7), alg_entry(-48), alg_entry(-49)]),
            ),
        ])))
    }

    fn make_credential(&mut self, body: &[u8], presence: &dyn PresenceCheck) -> CommandResult {
        let map = parse_map(body)?;
        if !presence.request() {
            return Err(CTAP2_ERR_KEEPALIVE_CANCEL);
        }

        let client_data_hash = map_get(&map, 1)
            .and_then(CborValue::as_bytes)
            .ok_or(CTAP2_ERR_OTHER)?
            .clone();
        let rp_id = map_get(&map, 2)
            .and_then(CborValue::as_map)
            .and_then(|rp| text_field(rp, "id"))
            .ok_or(CTAP2_ERR_OTHER)?
            .to_string();
        let user = map_get(&map, 3).ok_or(CTAP2_ERR_OTHER)?.clone();
        let user_id = user
            .as_map()
            .and_then(|u| bytes_field(u, "id"))
            .ok_or(CTAP2_ERR_OTHER)?
            .to_vec();
        let params = map_get(&map, 4)
            .and_then(CborValue::as_array)
            .ok_or(CTAP2_ERR_OTHER)?;

        let algorithm = Algorithm::choose(
            params
                .iter()
                .filter_map(|p| p.as_map().and_then(|m| int_field(m, "alg"))),
        );
        self.last_algo = algorithm.cose_alg();

        if let Some(excludes) = map_get(&map, 5).and_then(CborValue::as_array) {
            for entry in excludes {
                if let Some(id) = entry.as_map().and_then(|m| bytes_field(m, "id")) {
                    if self.store.contains(&rp_id, id) {
                        log::info!("registration for {} hit the exclude list", rp_id);
                        return Err(CTAP2_ERR_CREDENTIAL_EXCLUDED);
                    }
                }
            }
        }

        // Re-registering the same user replaces the credential under its
        // original ID instead of minting a second one.
        let cred_id = self
            .store
            .cred_id_for_user(&rp_id, &user_id)
            .unwrap_or_else(new_cred_id);

        let keypair = algorithm.generate().map_err(internal_error)?;
        let cose_key = algorithm
            .cose_key(&keypair.public_key)
            .map_err(internal_error)?;

        self.store
            .upsert(
                &rp_id,
                CredentialRecord {
                    cred_id: cred_id.clone(),
                    private_key: keypair.private_key.clone(),
                    user_id,
                    user_entity: user,
                    algorithm,
                },
            )
            .map_err(internal_error)?;

        let auth_data = attestation::registration_auth_data(&rp_id, &cred_id, &cose_key);
        let mut to_sign = auth_data.clone();
        to_sign.extend_from_slice(&client_data_hash);
        let signature = algorithm
            .sign(&keypair.private_key, &to_sign)
            .map_err(internal_error)?;

        log::info!(
            "registered credential for {} (alg {})",
            rp_id,
            algorithm.cose_alg()
        );
        Ok(Some(attestation::attestation_object(
            algorithm.cose_alg(),
            auth_data,
            signature,
        )))
    }

    fn get_assertion(&mut self, body: &[u8], presence: &dyn PresenceCheck) -> CommandResult {
        let map = parse_map(body)?;
        let rp_id = map_get(&map, 1)
            .and_then(CborValue::as_text)
            .ok_or(CTAP2_ERR_OTHER)?
            .to_string();
        let client_data_hash = map_get(&map, 2)
            .and_then(CborValue::as_bytes)
            .ok_or(CTAP2_ERR_OTHER)?
            .clone();
        let allow_list = map_get(&map, 3).and_then(CborValue::as_array);

        let candidates: Vec<CredentialRecord> = match allow_list {
            None => self.store.creds_for_rp(&rp_id).to_vec(),
            Some(list) if list.is_empty() => self.store.creds_for_rp(&rp_id).to_vec(),
            Some(list) => list
                .iter()
                .filter_map(|entry| entry.as_map().and_then(|m| bytes_field(m, "id")))
                .filter_map(|id| self.store.find(&rp_id, id).cloned())
                .collect(),
        };

        if candidates.is_empty() {
            log::info!("no credentials for {}", rp_id);
            self.cursor = None;
            return Err(CTAP2_ERR_NO_CREDENTIALS);
        }

        let auth_data = attestation::assertion_auth_data(&rp_id);
        let mut to_sign = auth_data.clone();
        to_sign.extend_from_slice(&client_data_hash);

        let total = candidates.len();
        let mut assertions = Vec::with_capacity(total);
        for (index, record) in candidates.iter().enumerate() {
            self.last_algo = record.algorithm.cose_alg();
            let signature = record
                .algorithm
                .sign(&record.private_key, &to_sign)
                .map_err(internal_error)?;
            let mut pairs = vec![
                (CborValue::Integer(1.into()), record.descriptor()),
                (
                    CborValue::Integer(2.into()),
                    CborValue::Bytes(auth_data.clone()),
                ),
                (CborValue::Integer(3.into()), CborValue::Bytes(signature)),
                (CborValue::Integer(4.into()), record.user_entity.clone()),
            ];
            if index == 0 {
                pairs.push((
                    CborValue::Integer(5.into()),
                    CborValue::Integer((total as i64).into()),
                ));
            }
            assertions.push(CborValue::Map(pairs));
        }

        let first = assertions[0].clone();
        self.cursor = Some(AssertionCursor {
            assertions,
            index: 1,
            refreshed_at: Instant::now(),
        });

        if !presence.request() {
            self.cursor = None;
            return Err(CTAP2_ERR_KEEPALIVE_CANCEL);
        }

        log::info!("asserting {} credential(s) for {}", total, rp_id);
        Ok(Some(first))
    }

    fn get_next_assertion(&mut self) -> CommandResult {
        let Some(cursor) = self.cursor.as_mut() else {
            return Err(CTAP2_ERR_NOT_ALLOWED);
        };
        if cursor.index >= cursor.assertions.len()
            || cursor.refreshed_at.elapsed() > CURSOR_TTL
        {
            self.cursor = None;
            return Err(CTAP2_ERR_NOT_ALLOWED);
        }

        cursor.refreshed_at = Instant::now();
        let assertion = cursor.assertions[cursor.index].clone();
        cursor.index += 1;
        Ok(Some(assertion))
    }

    fn reset(&mut self, presence: &dyn PresenceCheck) -> CommandResult {
        // Wiping every credential is the one operation that must never be
        // reachable by a host alone.
        if !presence.request() {
            return Err(CTAP2_ERR_KEEPALIVE_CANCEL);
        }
        self.cursor = None;
        self.store.reset().map_err(internal_error)?;
        Ok(None)
    }
}

fn new_cred_id() -> Vec<u8> {
    let mut id = rand::random::<[u8; 16]>().to_vec();
    id.extend_from_slice(CRED_ID_SUFFIX);
    id
}

fn internal_error(e: anyhow::Error) -> u8 {
    log::error!("CTAP2 internal failure: {:#}", e);
    CTAP2_ERR_OTHER
}

fn parse_map(body: &[u8]) -> Result<Vec<(CborValue, CborValue)>, u8> {
    let value: CborValue = ciborium::from_reader(body).map_err(|e| {
        log::warn!("malformed CBOR request: {}", e);
        CTAP2_ERR_OTHER
    })?;
    value.into_map().map_err(|_| CTAP2_ERR_OTHER)
}

pub(crate) fn map_get<'a>(map: &'a [(CborValue, CborValue)], key: i64) -> Option<&'a CborValue> {
    map.iter()
        .find(|(k, _)| matches!(k, CborValue::Integer(i) if i128::from(*i) == key as i128))
        .map(|(_, v)| v)
}

fn text_field<'a>(map: &'a [(CborValue, CborValue)], name: &str) -> Option<&'a str> {
    field(map, name).and_then(CborValue::as_text)
}

pub(crate) fn bytes_field<'a>(map: &'a [(CborValue, CborValue)], name: &str) -> Option<&'a [u8]> {
    field(map, name).and_then(|v| v.as_bytes().map(Vec::as_slice))
}

pub(crate) fn int_field(map: &[(CborValue, CborValue)], name: &str) -> Option<i64> {
    field(map, name)
        .and_then(CborValue::as_integer)
        .and_then(|i| i128::from(i).try_into().ok())
}

pub(crate) fn field<'a>(
    map: &'a [(CborValue, CborValue)],
    name: &str,
) -> Option<&'a CborValue> {
    map.iter()
        .find(|(k, _)| k.as_text() == Some(name))
        .map(|(_, v)| v)
}
