/// One completed play, as persisted in a user's record log
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Record {
    pub track: String,
    pub track_mbid: String,
    pub album: String,
    pub album_mbid: String,
    pub artist: String,
    pub artist_mbid: String,
    // display string as reported by last.fm, e.g. "05 Mar 2021, 18:02"
    pub date: String,
    // play time in seconds from epoch, always > 0 for stored records
    pub date_timestamp: i64,
}

impl Record {
    pub fn to_rest(&self) -> RecordRest {
        RecordRest {
            track: MbidEntity {
                name: self.track.clone(),
                mbid: self.track_mbid.clone(),
            },
            album: MbidEntity {
                name: self.album.clone(),
                mbid: self.album_mbid.clone(),
            },
            artist: MbidEntity {
                name: self.artist.clone(),
                mbid: self.artist_mbid.clone(),
            },
            ts: self.date_timestamp,
        }
    }
}

/// The state left behind by the last committed scan of a user.
/// A missing watermark reads as `ScanWatermark::default()`, i.e. a
/// `max_record_timestamp` of 0 which forces a full history backfill.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ScanWatermark {
    // newest ingested record timestamp
    pub max_record_timestamp: i64,
    // wall clock seconds of the committing scan
    pub run_timestamp: i64,
    // number of records the committing scan ingested
    pub records_found: usize,
    pub username: String,
}

impl ScanWatermark {
    /// Summarize a freshly scanned batch
    pub fn from_batch(username: &str, records: &[Record], run_timestamp: i64) -> Self {
        let max_record_timestamp = records
            .iter()
            .map(|r| r.date_timestamp)
            .max()
            .unwrap_or(0);
        Self {
            max_record_timestamp,
            run_timestamp,
            records_found: records.len(),
            username: username.to_string(),
        }
    }
}

/// System wide registry of users that get synced
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SystemInfo {
    pub users: Vec<String>,
}

impl SystemInfo {
    pub fn has_user(&self, username: &str) -> bool {
        self.users.iter().any(|u| u == username)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MbidEntity {
    pub name: String,
    pub mbid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RecordRest {
    pub track: MbidEntity,
    pub album: MbidEntity,
    pub artist: MbidEntity,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    pub last_scan_records_found: usize,
    pub last_scan_timestamp: i64,
    pub last_scan_max_record_timestamp: i64,
    pub total_records: usize,
}

impl UserStatus {
    pub fn new(scan: &ScanWatermark, total_records: usize) -> Self {
        Self {
            last_scan_records_found: scan.records_found,
            last_scan_timestamp: scan.run_timestamp,
            last_scan_max_record_timestamp: scan.max_record_timestamp,
            total_records,
        }
    }
}

#[cfg(test)]
pub fn record(ts: i64) -> Record {
    Record {
        track: format!("track-{}", ts),
        track_mbid: String::new(),
        album: "album".to_string(),
        album_mbid: String::new(),
        artist: "artist".to_string(),
        artist_mbid: "a-mbid".to_string(),
        date: String::new(),
        date_timestamp: ts,
    }
}
