use slog::o;
use slog::Drain;
use std::io::Read;
use std::sync::Arc;
use std::{env, fs};

/// Log an error message and hand back the formatted `String` so it
/// can be turned into a `crate::Error` with `?` or `.into()`
#[macro_export]
macro_rules! se {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        slog::error!($crate::LOG, "{}", msg);
        msg
    }};
}

/// Build json responses
#[macro_export]
macro_rules! resp {
    (json => $obj:expr) => {{
        tide::Response::builder(200)
            .body(tide::Body::from_json(&$obj)?)
            .build()
    }};
    (status => $status:expr, json => $obj:expr) => {{
        tide::Response::builder($status)
            .body(tide::Body::from_json(&$obj)?)
            .build()
    }};
    (status => $status:expr, message => $msg:expr) => {{
        tide::Response::builder($status)
            .body(serde_json::json!({ "error": $msg }))
            .build()
    }};
}

mod error;
mod lastfm;
mod logging;
mod models;
mod scanner;
mod service;
mod store;
mod sync;
mod utils;

pub use error::{Error, Result};

fn env_or(k: &str, default: &str) -> String {
    env::var(k).unwrap_or_else(|_| default.to_string())
}

lazy_static::lazy_static! {
    pub static ref CONFIG: Config = Config::load();

    // The "base" logger that all crates should branch off of
    pub static ref BASE_LOG: slog::Logger = {
        let level: slog::Level = CONFIG.log_level
                .parse()
                .expect("invalid log_level");
        if CONFIG.log_format == "pretty" {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::CompactFormat::new(decorator).build().fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, o!())
        } else {
            let drain = slog_json::Json::default(std::io::stderr()).fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, o!())
        }
    };

    // Base logger
    pub static ref LOG: slog::Logger = BASE_LOG.new(slog::o!("app" => "lastsync"));
}

/// Last.fm refuses page sizes above this
pub const MAX_PAGE_LIMIT: u32 = 200;

#[derive(serde::Deserialize)]
pub struct Config {
    pub version: String,
    pub host: String,
    pub port: u16,
    pub log_format: String,
    pub log_level: String,
    pub lastfm_api_key: String,
    pub lastfm_api_url: String,
    pub db_path: String,
    pub update_delay_seconds: u64,
    pub page_limit: u32,
    pub fetch_timeout_seconds: u64,
    pub max_scan_pages: u32,
}
impl Config {
    pub fn load() -> Self {
        let version = fs::File::open("commit_hash.txt")
            .map(|mut f| {
                let mut s = String::new();
                f.read_to_string(&mut s).expect("Error reading commit_hash");
                s.trim().to_string()
            })
            .unwrap_or_else(|_| "unknown".to_string());
        let page_limit: u32 = env_or("PAGE_LIMIT", "200")
            .parse()
            .expect("invalid page_limit");
        Self {
            version,
            host: env_or("HOST", "0.0.0.0"),
            port: env_or("PORT", "8080").parse().expect("invalid port"),
            log_format: env_or("LOG_FORMAT", "json")
                .to_lowercase()
                .trim()
                .to_string(),
            log_level: env_or("LOG_LEVEL", "INFO"),
            lastfm_api_key: env_or("LASTFM_API_KEY", ""),
            lastfm_api_url: env_or("LASTFM_API_URL", "http://ws.audioscrobbler.com/2.0/"),
            db_path: env_or("DB_PATH", "stat.db"),
            update_delay_seconds: env_or("UPDATE_DELAY_SECONDS", "60")
                .parse()
                .expect("invalid update_delay_seconds"),
            page_limit: page_limit.max(1).min(MAX_PAGE_LIMIT),
            fetch_timeout_seconds: env_or("FETCH_TIMEOUT_SECONDS", "30")
                .parse()
                .expect("invalid fetch_timeout_seconds"),
            max_scan_pages: env_or("MAX_SCAN_PAGES", "10000")
                .parse()
                .expect("invalid max_scan_pages"),
        }
    }
    pub fn initialize(&self) -> anyhow::Result<()> {
        if self.lastfm_api_key.trim().is_empty() {
            anyhow::bail!("LASTFM_API_KEY is required");
        }
        slog::info!(
            LOG, "initialized config";
            "version" => &CONFIG.version,
            "host" => &CONFIG.host,
            "port" => &CONFIG.port,
            "log_format" => &CONFIG.log_format,
            "log_level" => &CONFIG.log_level,
            "db_path" => &CONFIG.db_path,
            "update_delay_seconds" => CONFIG.update_delay_seconds,
            "page_limit" => CONFIG.page_limit,
            "fetch_timeout_seconds" => CONFIG.fetch_timeout_seconds,
            "max_scan_pages" => CONFIG.max_scan_pages,
        );
        Ok(())
    }
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
    pub fn scan_settings(&self) -> scanner::ScanSettings {
        scanner::ScanSettings {
            page_limit: self.page_limit,
            max_pages: self.max_scan_pages,
        }
    }
}

#[async_std::main]
async fn main() -> anyhow::Result<()> {
    // try sourcing a .env if one exists
    dotenv::dotenv().ok();
    CONFIG.initialize()?;

    slog::info!(LOG, "opening store at {}", CONFIG.db_path);
    let store = store::Store::open(&CONFIG.db_path)?;
    let source: Arc<dyn lastfm::HistorySource> = Arc::new(lastfm::LastfmSource::new(
        &CONFIG.lastfm_api_url,
        &CONFIG.lastfm_api_key,
        std::time::Duration::from_secs(CONFIG.fetch_timeout_seconds),
    ));

    async_std::task::spawn(sync::background_sync_poll(
        store.clone(),
        source,
        CONFIG.scan_settings(),
        std::time::Duration::from_secs(CONFIG.update_delay_seconds),
    ));

    service::start(store).await?;
    Ok(())
}
