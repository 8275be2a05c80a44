use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ciborium::Value as CborValue;

use crate::crypto::Algorithm;

/// One stored credential.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialRecord {
    pub cred_id: Vec<u8>,
    pub private_key: Vec<u8>,
    pub user_id: Vec<u8>,
    /// The client-supplied user object (id, name, displayName), echoed back
    /// verbatim in assertions.
    pub user_entity: CborValue,
    pub algorithm: Algorithm,
}

impl CredentialRecord {
    /// PublicKeyCredentialDescriptor for this credential:
    /// `{"id": credId, "type": "public-key"}`.
    pub fn descriptor(&self) -> CborValue {
        CborValue::Map(vec![
            (
                CborValue::Text("id".to_string()),
                CborValue::Bytes(self.cred_id.clone()),
            ),
            (
                CborValue::Text("type".to_string()),
                CborValue::Text("public-key".to_string()),
            ),
        ])
    }

    fn to_value(&self) -> CborValue {
        CborValue::Map(vec![
            (
                CborValue::Text("pvtkey".to_string()),
                CborValue::Bytes(self.private_key.clone()),
            ),
            (
                CborValue::Text("userid".to_string()),
                CborValue::Bytes(self.user_id.clone()),
            ),
            (
                CborValue::Text("userentity".to_string()),
                self.user_entity.clone(),
            ),
            (
                CborValue::Text("algo".to_string()),
                CborValue::Integer(self.algorithm.cose_alg().into()),
            ),
            (
                CborValue::Text("publickeyentity".to_string()),
                self.descriptor(),
            ),
        ])
    }

    fn from_value(cred_id: Vec<u8>, value: CborValue) -> Result<Self> {
        let pairs = value
            .into_map()
            .map_err(|_| anyhow!("credential record is not a map"))?;

        let mut private_key = None;
        let mut user_id = None;
        let mut user_entity = None;
        let mut algorithm = None;

        for (key, value) in pairs {
            let Some(name) = key.as_text() else { continue };
            match name {
                "pvtkey" => {
                    private_key = Some(
                        value
                            .into_bytes()
                            .map_err(|_| anyhow!("pvtkey is not a byte string"))?,
                    )
                }
                "userid" => {
                    user_id = Some(
                        value
                            .into_bytes()
                            .map_err(|_| anyhow!("userid is not a byte string"))?,
                    )
                }
                "userentity" => user_entity = Some(value),
                "algo" => {
                    let alg: i64 = value
                        .as_integer()
                        .and_then(|i| i128::from(i).try_into().ok())
                        .ok_or_else(|| anyhow!("algo is not an integer"))?;
                    algorithm = Some(
                        Algorithm::from_cose(alg)
                            .ok_or_else(|| anyhow!("unsupported stored algorithm {}", alg))?,
                    );
                }
                // publickeyentity is derivable from the credential ID
                _ => {}
            }
        }

        Ok(CredentialRecord {
            cred_id,
            private_key: private_key.ok_or_else(|| anyhow!("record missing pvtkey"))?,
            user_id: user_id.ok_or_else(|| anyhow!("record missing userid"))?,
            user_entity: user_entity.ok_or_else(|| anyhow!("record missing userentity"))?,
            algorithm: algorithm.ok_or_else(|| anyhow!("record missing algo"))?,
        })
    }
}

/// On-disk credential database: a CBOR `map<rpId, map<credId, record>>`,
/// insertion-ordered, rewritten through a temp file + rename on every
/// mutation.
pub struct CredentialStore {
    path: PathBuf,
    rps: Vec<(String, Vec<CredentialRecord>)>,
}

impl CredentialStore {
    /// Load the store, creating an empty one (and its parent directory) on
    /// first run.
    pub fn load(path: &Path) -> Result<Self> {
        let mut store = CredentialStore {
            path: path.to_path_buf(),
            rps: Vec::new(),
        };

        if !path.exists() {
            log::info!("credential store {} missing, creating", path.display());
            store.persist()?;
            return Ok(store);
        }

        let raw = fs::read(path)
            .with_context(|| format!("failed to read credential store {}", path.display()))?;
        let value: CborValue = ciborium::from_reader(raw.as_slice())
            .with_context(|| format!("credential store {} is corrupt", path.display()))?;
        let rp_pairs = value
            .into_map()
            .map_err(|_| anyhow!("credential store root is not a map"))?;

        for (rp_key, creds_value) in rp_pairs {
            let rp_id = rp_key
                .into_text()
                .map_err(|_| anyhow!("relying-party key is not a text string"))?;
            let cred_pairs = creds_value
                .into_map()
                .map_err(|_| anyhow!("credential set for {} is not a map", rp_id))?;
            let mut records = Vec::with_capacity(cred_pairs.len());
            for (cred_key, record_value) in cred_pairs {
                let cred_id = cred_key
                    .into_bytes()
                    .map_err(|_| anyhow!("credential key is not a byte string"))?;
                records.push(CredentialRecord::from_value(cred_id, record_value)?);
            }
            store.rps.push((rp_id, records));
        }

        log::info!(
            "loaded {} credential(s) across {} relying part(ies)",
            store.total_credentials(),
            store.rps.len()
        );
        Ok(store)
    }

    /// All credentials registered for `rp_id`, in registration order.
    pub fn creds_for_rp(&self, rp_id: &str) -> &[CredentialRecord] {
        self.rps
            .iter()
            .find(|(rp, _)| rp == rp_id)
            .map(|(_, records)| records.as_slice())
            .unwrap_or(&[])
    }

    /// Look up a single credential by `(rp_id, cred_id)`.
    pub fn find(&self, rp_id: &str, cred_id: &[u8]) -> Option<&CredentialRecord> {
        self.creds_for_rp(rp_id)
            .iter()
            .find(|record| record.cred_id == cred_id)
    }

    pub fn contains(&self, rp_id: &str, cred_id: &[u8]) -> bool {
        self.find(rp_id, cred_id).is_some()
    }

    /// Credential ID already registered for `(rp_id, user_id)`, if any.
    /// Registration reuses this ID so a user never accumulates duplicates.
    pub fn cred_id_for_user(&self, rp_id: &str, user_id: &[u8]) -> Option<Vec<u8>> {
        self.creds_for_rp(rp_id)
            .iter()
            .find(|record| record.user_id == user_id)
            .map(|record| record.cred_id.clone())
    }

    /// Insert or replace the credential with `record.cred_id` under `rp_id`,
    /// keeping its position when replacing, then persist.
    pub fn upsert(&mut self, rp_id: &str, record: CredentialRecord) -> Result<()> {
        match self.rps.iter_mut().find(|(rp, _)| rp == rp_id) {
            Some((_, records)) => {
                match records.iter_mut().find(|r| r.cred_id == record.cred_id) {
                    Some(existing) => *existing = record,
                    None => records.push(record),
                }
            }
            None => self.rps.push((rp_id.to_string(), vec![record])),
        }
        self.persist()
    }

    /// Erase every credential and delete the store file.
    pub fn reset(&mut self) -> Result<()> {
        self.rps.clear();
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to delete credential store {}", self.path.display())
                })
            }
        }
        log::info!("credential store erased");
        Ok(())
    }

    pub fn total_credentials(&self) -> usize {
        self.rps.iter().map(|(_, records)| records.len()).sum()
    }

    fn to_value(&self) -> CborValue {
        CborValue::Map(
            self.rps
                .iter()
                .map(|(rp_id, records)| {
                    (
                        CborValue::Text(rp_id.clone()),
                        CborValue::Map(
                            records
                                .iter()
                                .map(|record| {
                                    (CborValue::Bytes(record.cred_id.clone()), record.to_value())
                                })
                                .collect(),
                        ),
                    )
                })
                .collect(),
        )
    }

    /// Serialize the whole map to a sibling temp file, fsync, then rename
    /// over the store path. Readers only ever observe the previous or the
    /// new state.
    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut encoded = Vec::new();
        ciborium::into_writer(&self.to_value(), &mut encoded)
            .context("failed to encode credential store")?;

        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| anyhow!("store path has no file name"))?
            .to_string_lossy();
        let tmp_path = self.path.with_file_name(format!("{}.tmp", file_name));

        let mut tmp = File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        tmp.write_all(&encoded)
            .and_then(|_| tmp.sync_all())
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed to move {} into place as {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;

        log::debug!(
            "persisted credential store ({} bytes, {} credential(s))",
            encoded.len(),
            self.total_credentials()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(cred_id: &[u8], user_id: &[u8], marker: u8) -> CredentialRecord {
        CredentialRecord {
            cred_id: cred_id.to_vec(),
            private_key: vec![marker; 32],
            user_id: user_id.to_vec(),
            user_entity: CborValue::Map(vec![(
                CborValue::Text("id".to_string()),
                CborValue::Bytes(user_id.to_vec()),
            )]),
            algorithm: Algorithm::EcdsaP256,
        }
    }

    fn temp_store() -> (tempfile::TempDir, CredentialStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(&dir.path().join("keys.secret")).unwrap();
        (dir, store)
    }

    #[test]
    fn missing_file_starts_empty_and_is_created() {
        let (dir, store) = temp_store();
        assert_eq!(store.total_credentials(), 0);
        assert!(dir.path().join("keys.secret").exists());
    }

    #[test]
    fn upsert_appends_then_replaces_in_place() {
        let (_dir, mut store) = temp_store();
        store.upsert("example.com", record(b"cred-a", b"user-1", 1)).unwrap();
        store.upsert("example.com", record(b"cred-b", b"user-2", 2)).unwrap();
        // Replacing cred-a keeps it first.
        store.upsert("example.com", record(b"cred-a", b"user-1", 3)).unwrap();

        let records = store.creds_for_rp("example.com");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].cred_id, b"cred-a");
        assert_eq!(records[0].private_key, vec![3; 32]);
        assert_eq!(records[1].cred_id, b"cred-b");
    }

    #[test]
    fn cred_id_for_user_finds_existing_registration() {
        let (_dir, mut store) = temp_store();
        store.upsert("example.com", record(b"cred-a", b"user-1", 1)).unwrap();
        assert_eq!(
            store.cred_id_for_user("example.com", b"user-1"),
            Some(b"cred-a".to_vec())
        );
        assert_eq!(store.cred_id_for_user("example.com", b"user-9"), None);
        assert_eq!(store.cred_id_for_user("other.org", b"user-1"), None);
    }

    #[test]
    fn reload_preserves_contents_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.secret");
        {
            let mut store = CredentialStore::load(&path).unwrap();
            store.upsert("b.example", record(b"cred-1", b"u1", 1)).unwrap();
            store.upsert("a.example", record(b"cred-2", b"u2", 2)).unwrap();
            store.upsert("b.example", record(b"cred-3", b"u3", 3)).unwrap();
        }

        let reloaded = CredentialStore::load(&path).unwrap();
        assert_eq!(reloaded.total_credentials(), 3);
        // Insertion order survives the CBOR roundtrip, for RPs and for
        // credentials within an RP.
        assert_eq!(reloaded.rps[0].0, "b.example");
        assert_eq!(reloaded.rps[1].0, "a.example");
        let b_records = reloaded.creds_for_rp("b.example");
        assert_eq!(b_records[0].cred_id, b"cred-1");
        assert_eq!(b_records[1].cred_id, b"cred-3");
        assert_eq!(b_records[0], record(b"cred-1", b"u1", 1));
    }

    #[test]
    fn persist_leaves_no_temp_file_behind() {
        let (dir, mut store) = temp_store();
        store.upsert("example.com", record(b"cred-a", b"user-1", 1)).unwrap();
        assert!(!dir.path().join("keys.secret.tmp").exists());
    }

    #[test]
    fn reset_deletes_file_and_clears_memory() {
        let (dir, mut store) = temp_store();
        store.upsert("example.com", record(b"cred-a", b"user-1", 1)).unwrap();
        store.reset().unwrap();
        assert_eq!(store.total_credentials(), 0);
        assert!(!dir.path().join("keys.secret").exists());
        // The next mutation recreates the file from an empty map.
        store.upsert("example.com", record(b"cred-b", b"user-2", 2)).unwrap();
        assert!(dir.path().join("keys.secret").exists());
        let reloaded = CredentialStore::load(&dir.path().join("keys.secret")).unwrap();
        assert_eq!(reloaded.total_credentials(), 1);
    }

    #[test]
    fn corrupt_store_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.secret");
        fs::write(&path, b"\xFF\xFF not cbor").unwrap();
        assert!(CredentialStore::load(&path).is_err());
    }
}
