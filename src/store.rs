/*!
Persistent state backed by sled

Each registered user gets their own tree (`user.<name>`) holding two
entries: `scan`, the watermark left by the last committed scan, and
`records`, the full json encoded record log. The `system` tree holds the
user registry under `info`.
*/
use std::path::Path;

use serde::de::DeserializeOwned;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree,
};

use crate::models::{Record, ScanWatermark, SystemInfo};
use crate::{Error, Result};

const SYSTEM_TREE: &str = "system";
const INFO_KEY: &[u8] = b"info";
const SCAN_KEY: &[u8] = b"scan";
const RECORDS_KEY: &[u8] = b"records";

fn user_tree_name(username: &str) -> String {
    format!("user.{}", username)
}

fn decode<T: DeserializeOwned + Default>(value: Option<sled::IVec>) -> Result<T> {
    match value {
        Some(v) => Ok(serde_json::from_slice(&v)?),
        None => Ok(T::default()),
    }
}

fn tx_decode<T: DeserializeOwned + Default>(
    value: Option<sled::IVec>,
) -> ConflictableTransactionResult<T, Error> {
    decode(value).map_err(ConflictableTransactionError::Abort)
}

fn tx_encode<T: serde::Serialize>(value: &T) -> ConflictableTransactionResult<Vec<u8>, Error> {
    serde_json::to_vec(value).map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

fn tx_set_watermark(
    tx: &TransactionalTree,
    scan: &ScanWatermark,
) -> ConflictableTransactionResult<(), Error> {
    tx.insert(SCAN_KEY, tx_encode(scan)?)?;
    Ok(())
}

fn tx_append_records<'a, I>(
    tx: &TransactionalTree,
    records: I,
) -> ConflictableTransactionResult<(), Error>
where
    I: IntoIterator<Item = &'a Record>,
{
    let mut saved: Vec<Record> = tx_decode(tx.get(RECORDS_KEY)?)?;
    saved.extend(records.into_iter().cloned());
    tx.insert(RECORDS_KEY, tx_encode(&saved)?)?;
    Ok(())
}

#[derive(Clone)]
pub struct Store {
    db: sled::Db,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    fn user_tree(&self, username: &str) -> Result<sled::Tree> {
        Ok(self.db.open_tree(user_tree_name(username))?)
    }

    /// Like `user_tree` but doesn't create trees for users we've
    /// never written anything for.
    fn existing_user_tree(&self, username: &str) -> Result<Option<sled::Tree>> {
        let name = user_tree_name(username);
        let exists = self
            .db
            .tree_names()
            .iter()
            .any(|n| &n[..] == name.as_bytes());
        if !exists {
            return Ok(None);
        }
        Ok(Some(self.db.open_tree(name)?))
    }

    /// The last committed watermark, zero valued if the user was never scanned
    pub fn get_watermark(&self, username: &str) -> Result<ScanWatermark> {
        match self.existing_user_tree(username)? {
            Some(tree) => decode(tree.get(SCAN_KEY)?),
            None => Ok(ScanWatermark::default()),
        }
    }

    /// Overwrite the stored watermark. Only safe once the records it
    /// covers are stored, prefer `commit_scan`.
    #[allow(dead_code)]
    pub fn set_watermark(&self, username: &str, scan: &ScanWatermark) -> Result<()> {
        let tree = self.user_tree(username)?;
        tree.transaction(|tx| tx_set_watermark(tx, scan))?;
        tree.flush()?;
        Ok(())
    }

    /// All of a user's records in the order they were stored
    pub fn get_records(&self, username: &str) -> Result<Vec<Record>> {
        match self.existing_user_tree(username)? {
            Some(tree) => decode(tree.get(RECORDS_KEY)?),
            None => Ok(vec![]),
        }
    }

    /// Append `records` to the stored log. No deduplication happens here.
    #[allow(dead_code)]
    pub fn append_records(&self, username: &str, records: &[Record]) -> Result<()> {
        let tree = self.user_tree(username)?;
        tree.transaction(|tx| tx_append_records(tx, records))?;
        tree.flush()?;
        Ok(())
    }

    /// Merge a scanned batch and advance the watermark as one transaction.
    ///
    /// Records at or below the currently stored watermark are dropped, so
    /// committing the same batch twice stores it once. The stored
    /// watermark never moves backwards. Returns the number of records
    /// actually added.
    pub fn commit_scan(
        &self,
        username: &str,
        records: &[Record],
        scan: &ScanWatermark,
    ) -> Result<usize> {
        let tree = self.user_tree(username)?;
        let added = tree.transaction(|tx| -> ConflictableTransactionResult<usize, Error> {
            let stored: ScanWatermark = tx_decode(tx.get(SCAN_KEY)?)?;
            let fresh: Vec<&Record> = records
                .iter()
                .filter(|r| r.date_timestamp > stored.max_record_timestamp)
                .collect();
            if fresh.is_empty() {
                return Ok(0);
            }

            tx_append_records(tx, fresh.iter().copied())?;

            let fresh_max = fresh.iter().map(|r| r.date_timestamp).max().unwrap_or(0);
            let next = ScanWatermark {
                max_record_timestamp: scan
                    .max_record_timestamp
                    .max(stored.max_record_timestamp)
                    .max(fresh_max),
                run_timestamp: scan.run_timestamp,
                records_found: fresh.len(),
                username: username.to_string(),
            };
            tx_set_watermark(tx, &next)?;
            Ok(fresh.len())
        })?;
        if added > 0 {
            tree.flush()?;
        }
        Ok(added)
    }

    pub fn get_system_info(&self) -> Result<SystemInfo> {
        let tree = self.db.open_tree(SYSTEM_TREE)?;
        decode(tree.get(INFO_KEY)?)
    }

    /// Register a new user, `Error::UserExists` if they already are
    pub fn add_user(&self, username: &str) -> Result<()> {
        let tree = self.db.open_tree(SYSTEM_TREE)?;
        tree.transaction(|tx| -> ConflictableTransactionResult<(), Error> {
            let mut info: SystemInfo = tx_decode(tx.get(INFO_KEY)?)?;
            if info.has_user(username) {
                return sled::transaction::abort(Error::UserExists(username.to_string()));
            }
            info.users.push(username.to_string());
            tx.insert(INFO_KEY, tx_encode(&info)?)?;
            Ok(())
        })?;
        tree.flush()?;
        Ok(())
    }
}
