/*!
Last.fm recent tracks client

Pages of `user.getrecenttracks` are returned newest-first, page 1 being
the most recent. The adapter does no retrying, failures are handed back
to the caller to deal with on the next tick.
*/
use std::time::Duration;

use crate::models::Record;
use crate::{Error, Result, LOG};

/// One page of raw history entries plus the pagination metadata
/// reported alongside them.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub tracks: Vec<LastfmTrack>,
    pub page: u32,
    pub total_pages: u32,
    // the response body couldn't be understood, `tracks` is empty
    pub malformed: bool,
}

impl HistoryPage {
    fn malformed(requested: u32) -> Self {
        Self {
            tracks: vec![],
            page: requested,
            total_pages: 0,
            malformed: true,
        }
    }
}

#[async_trait::async_trait]
pub trait HistorySource: Send + Sync {
    /// Fetch page `page` (1-based) of `username`'s history using
    /// pages of `limit` entries.
    async fn fetch_page(&self, username: &str, page: u32, limit: u32) -> Result<HistoryPage>;
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct LastfmNamed {
    #[serde(rename = "#text", default, deserialize_with = "lenient_string")]
    pub text: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub mbid: String,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct LastfmDate {
    #[serde(default, deserialize_with = "lenient_string")]
    pub uts: String,
    #[serde(rename = "#text", default, deserialize_with = "lenient_string")]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct LastfmTrack {
    #[serde(default)]
    pub artist: LastfmNamed,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub mbid: String,
    #[serde(default)]
    pub album: LastfmNamed,
    // absent for the "now playing" entry
    #[serde(default)]
    pub date: Option<LastfmDate>,
}

impl LastfmTrack {
    /// Convert to a `Record`. Entries without a usable play timestamp
    /// are in-progress plays and yield `None`.
    pub fn to_record(&self) -> Option<Record> {
        let date = self.date.as_ref()?;
        let ts = date.uts.trim().parse::<i64>().ok().filter(|ts| *ts > 0)?;
        Some(Record {
            track: self.name.clone(),
            track_mbid: self.mbid.clone(),
            album: self.album.text.clone(),
            album_mbid: self.album.mbid.clone(),
            artist: self.artist.text.clone(),
            artist_mbid: self.artist.mbid.clone(),
            date: date.text.clone(),
            date_timestamp: ts,
        })
    }
}

#[derive(Debug, Default, serde::Deserialize)]
struct PageAttr {
    #[serde(default, deserialize_with = "lenient_string")]
    page: String,
    #[serde(rename = "totalPages", default, deserialize_with = "lenient_string")]
    total_pages: String,
}

#[derive(Debug, serde::Deserialize)]
struct RecentTracks {
    // a page holding a single entry comes back as an object
    #[serde(default, deserialize_with = "one_or_many")]
    track: Vec<LastfmTrack>,
    #[serde(rename = "@attr", default)]
    attr: PageAttr,
}

#[derive(Debug, serde::Deserialize)]
struct RecentTracksResponse {
    recenttracks: Option<RecentTracks>,
}

/// Accept strings, numbers and nulls where last.fm promises strings
fn lenient_string<'de, D>(d: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    Ok(match Option::<serde_json::Value>::deserialize(d)? {
        Some(serde_json::Value::String(s)) => s,
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(serde_json::Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    })
}

fn one_or_many<'de, D>(d: D) -> std::result::Result<Vec<LastfmTrack>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match value {
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match serde_json::from_value(item) {
                Ok(track) => Some(track),
                Err(e) => {
                    slog::warn!(LOG, "skipping unreadable track entry {}", e);
                    None
                }
            })
            .collect(),
        Some(item @ serde_json::Value::Object(_)) => match serde_json::from_value(item) {
            Ok(track) => vec![track],
            Err(e) => {
                slog::warn!(LOG, "skipping unreadable track entry {}", e);
                vec![]
            }
        },
        _ => vec![],
    })
}

/// Parse a `user.getrecenttracks` response body. Error payloads are
/// reported as fetch errors, anything else we can't make sense of
/// degrades to an empty page flagged as malformed.
pub fn parse_page(body: &[u8], requested: u32) -> Result<HistoryPage> {
    let value: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            slog::warn!(LOG, "unparseable history page {}: {}", requested, e);
            return Ok(HistoryPage::malformed(requested));
        }
    };
    if let Some(code) = value.get("error") {
        let message = value
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        return Err(Error::Fetch(format!("lastfm error {}: {}", code, message)));
    }
    let resp: RecentTracksResponse = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => {
            slog::warn!(LOG, "unexpected history page {} shape: {}", requested, e);
            return Ok(HistoryPage::malformed(requested));
        }
    };
    let recent = match resp.recenttracks {
        Some(r) => r,
        None => {
            slog::warn!(LOG, "history page {} has no recenttracks", requested);
            return Ok(HistoryPage::malformed(requested));
        }
    };
    Ok(HistoryPage {
        page: recent.attr.page.trim().parse().unwrap_or(requested),
        total_pages: recent.attr.total_pages.trim().parse().unwrap_or(0),
        tracks: recent.track,
        malformed: false,
    })
}

pub struct LastfmSource {
    client: surf::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl LastfmSource {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Self {
        Self {
            client: surf::Client::new(),
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            timeout,
        }
    }

    pub fn recent_tracks_url(&self, username: &str, page: u32, limit: u32) -> Result<surf::Url> {
        let mut url = surf::Url::parse(&self.base_url)
            .map_err(|e| se!("invalid lastfm url {}: {}", self.base_url, e))?;
        url.query_pairs_mut()
            .append_pair("method", "user.getrecenttracks")
            .append_pair("user", username)
            .append_pair("api_key", &self.api_key)
            .append_pair("page", &page.to_string())
            .append_pair("limit", &limit.to_string())
            .append_pair("format", "json");
        Ok(url)
    }

    async fn get_body(&self, url: surf::Url) -> Result<(surf::StatusCode, Vec<u8>)> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Fetch(format!("recent tracks request error {}", e)))?;
        let body = resp
            .body_bytes()
            .await
            .map_err(|e| Error::Fetch(format!("recent tracks body error {}", e)))?;
        Ok((resp.status(), body))
    }
}

#[async_trait::async_trait]
impl HistorySource for LastfmSource {
    async fn fetch_page(&self, username: &str, page: u32, limit: u32) -> Result<HistoryPage> {
        let url = self.recent_tracks_url(username, page, limit)?;
        slog::debug!(LOG, "fetching history page"; "user" => username, "page" => page);
        let (status, body) = async_std::future::timeout(self.timeout, self.get_body(url))
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;
        if !status.is_success() {
            // last.fm describes most failures in a json payload
            parse_page(&body, page)?;
            return Err(Error::Fetch(format!(
                "recent tracks for {} page {} returned {}",
                username, page, status
            )));
        }
        parse_page(&body, page)
    }
}
