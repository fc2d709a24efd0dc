/*!
Incremental history scanning

A scan walks a user's history page by page, newest first, until it
reaches the page holding the watermark (the newest timestamp we already
ingested) or runs out of pages. Only records strictly newer than the
watermark are kept: a record stamped exactly at the watermark was
ingested by the previous scan.
*/
use std::collections::HashSet;

use crate::lastfm::HistorySource;
use crate::models::Record;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettings {
    pub page_limit: u32,
    // safety bound, remote pagination isn't guaranteed to be stable
    pub max_pages: u32,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            page_limit: crate::MAX_PAGE_LIMIT,
            max_pages: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// every reported page was loaded
    Exhausted,
    /// the last page loaded reaches back past the watermark
    Boundary,
    /// a page came back unreadable
    Malformed,
    /// the remote answered with a different page than requested
    PageMismatch,
    /// gave up after `ScanSettings::max_pages`
    PageLimit,
}

impl StopReason {
    /// Whether the scan saw everything newer than its watermark.
    /// Incomplete scans must not be committed since the watermark
    /// would jump over records that were never fetched.
    pub fn is_complete(&self) -> bool {
        matches!(self, StopReason::Exhausted | StopReason::Boundary)
    }
}

#[derive(Debug)]
pub struct ScanOutcome {
    pub records: Vec<Record>,
    pub pages: u32,
    pub stop: StopReason,
}

pub fn has_records_older_than(records: &[Record], ts: i64) -> bool {
    records.iter().any(|r| r.date_timestamp < ts)
}

pub fn keep_newer_than(records: Vec<Record>, ts: i64) -> Vec<Record> {
    records
        .into_iter()
        .filter(|r| r.date_timestamp > ts)
        .collect()
}

/// Drop repeats of the same play. Entries shift towards older pages
/// while new plays are scrobbled mid scan, so one play can show up at
/// the bottom of a page and again at the top of the next.
pub fn dedup_plays(records: Vec<Record>) -> Vec<Record> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert((r.date_timestamp, r.track.clone(), r.artist.clone())))
        .collect()
}

/// Decide whether a scan is done after loading `last_page` of
/// `total_pages`, `page_records` being what that page held.
pub fn stop_reason(
    last_page: u32,
    total_pages: u32,
    page_records: &[Record],
    watermark: i64,
) -> Option<StopReason> {
    if last_page == 0 {
        return None;
    }
    if last_page >= total_pages {
        return Some(StopReason::Exhausted);
    }
    if has_records_older_than(page_records, watermark) {
        return Some(StopReason::Boundary);
    }
    None
}

/// A loaded page, converted to records
#[derive(Debug)]
pub struct LoadedPage {
    pub records: Vec<Record>,
    pub malformed: bool,
    // the response claimed to be some other page
    pub mismatched: bool,
}

/// Lazily pages through a user's history, newest first
pub struct PageCursor<'a> {
    source: &'a dyn HistorySource,
    username: &'a str,
    limit: u32,
    last_loaded_page: u32,
    total_pages: u32,
    pages_loaded: u32,
}

impl<'a> PageCursor<'a> {
    pub fn new(source: &'a dyn HistorySource, username: &'a str, limit: u32) -> Self {
        Self {
            source,
            username,
            limit: limit.max(1).min(crate::MAX_PAGE_LIMIT),
            last_loaded_page: 0,
            total_pages: 0,
            pages_loaded: 0,
        }
    }

    pub fn last_loaded_page(&self) -> u32 {
        self.last_loaded_page
    }

    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    pub fn pages_loaded(&self) -> u32 {
        self.pages_loaded
    }

    pub async fn next_page(&mut self) -> Result<LoadedPage> {
        let requested = self.last_loaded_page + 1;
        let page = self
            .source
            .fetch_page(self.username, requested, self.limit)
            .await?;
        self.pages_loaded += 1;
        let mismatched = page.page != requested;
        if mismatched {
            slog::warn!(
                crate::LOG, "history page mismatch";
                "user" => self.username,
                "requested" => requested,
                "reported" => page.page,
            );
        }
        // the reported page number is never trusted for positioning
        self.last_loaded_page = requested;
        self.total_pages = page.total_pages;
        Ok(LoadedPage {
            records: page.tracks.iter().filter_map(|t| t.to_record()).collect(),
            malformed: page.malformed,
            mismatched,
        })
    }
}

pub struct IncrementalScanner<'a> {
    cursor: PageCursor<'a>,
    watermark: i64,
    max_pages: u32,
}

impl<'a> IncrementalScanner<'a> {
    pub fn new(
        source: &'a dyn HistorySource,
        username: &'a str,
        watermark: i64,
        settings: ScanSettings,
    ) -> Self {
        Self {
            cursor: PageCursor::new(source, username, settings.page_limit),
            watermark,
            max_pages: settings.max_pages.max(1),
        }
    }

    pub async fn scan(mut self) -> Result<ScanOutcome> {
        let mut records = vec![];
        let stop = loop {
            let page = self.cursor.next_page().await?;
            if page.malformed {
                break StopReason::Malformed;
            }
            if page.mismatched {
                break StopReason::PageMismatch;
            }
            let stop = stop_reason(
                self.cursor.last_loaded_page(),
                self.cursor.total_pages(),
                &page.records,
                self.watermark,
            );
            records.extend(page.records);
            if let Some(stop) = stop {
                break stop;
            }
            if self.cursor.pages_loaded() >= self.max_pages {
                break StopReason::PageLimit;
            }
        };
        Ok(ScanOutcome {
            records: dedup_plays(keep_newer_than(records, self.watermark)),
            pages: self.cursor.pages_loaded(),
            stop,
        })
    }
}
