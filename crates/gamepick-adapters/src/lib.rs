//! Upstream source contracts and their Steam-backed implementations.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use gamepick_core::{CatalogCursor, EntryId};
use gamepick_storage::{is_rate_limit, FetchError, FetchedResponse, HttpFetcher, RetryDisposition};
use scraper::{Html, Selector};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const STORE_COOKIE: &str =
    "wants_mature_content=1; birthtime=946652401; lastagecheckage=1-January-2000";
const STORE_LANGUAGE: &str = "ko-KR,en-US;q=0.9,en;q=0.8";
const DEFAULT_PAGE_SIZE: u32 = 10_000;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("rate limited with status {0}")]
    RateLimited(u16),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("request failed: {message}")]
    Request { message: String, retryable: bool },
    #[error("could not decode body: {0}")]
    Decode(String),
    #[error("store page has no title")]
    RegionLock,
    #[error("store page is missing {0}")]
    MissingField(&'static str),
}

impl SourceError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SourceError::RateLimited(_))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::RateLimited(_) => true,
            SourceError::Status(code) => (500..600).contains(code),
            SourceError::Request { retryable, .. } => *retryable,
            SourceError::Decode(_) | SourceError::RegionLock | SourceError::MissingField(_) => {
                false
            }
        }
    }
}

impl From<FetchError> for SourceError {
    fn from(err: FetchError) -> Self {
        SourceError::Request {
            retryable: err.disposition() == RetryDisposition::Retryable,
            message: err.to_string(),
        }
    }
}

fn check_status(resp: &FetchedResponse) -> Result<(), SourceError> {
    if resp.is_success() {
        Ok(())
    } else if is_rate_limit(resp.status) {
        Err(SourceError::RateLimited(resp.status.as_u16()))
    } else {
        Err(SourceError::Status(resp.status.as_u16()))
    }
}

fn decode_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, SourceError> {
    serde_json::from_slice(body).map_err(|e| SourceError::Decode(e.to_string()))
}

/// One page of the catalog listing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CatalogPage {
    pub ids: Vec<EntryId>,
    pub has_more: bool,
    pub last_id: Option<EntryId>,
}

/// Descriptive fields scraped from the store page (source A).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePage {
    pub title: String,
    pub description: String,
    pub header_image: String,
    pub genres: Vec<String>,
}

/// Release metadata (source B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReleaseInfo {
    pub release_date: Option<NaiveDate>,
}

/// Community statistics (source C).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReviewStats {
    pub positive: u64,
    pub negative: u64,
    pub owners: String,
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Whether the source has everything it needs to issue requests.
    fn is_configured(&self) -> bool {
        true
    }

    async fn fetch_page(&self, cursor: &CatalogCursor) -> Result<CatalogPage, SourceError>;
}

#[async_trait]
pub trait DetailSource: Send + Sync {
    async fn store_page(&self, id: EntryId) -> Result<StorePage, SourceError>;

    async fn release_info(&self, id: EntryId) -> Result<ReleaseInfo, SourceError>;

    async fn review_stats(&self, id: EntryId) -> Result<ReviewStats, SourceError>;
}

#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn current_value(&self, id: EntryId) -> Result<u64, SourceError>;
}

#[derive(Debug, Deserialize)]
struct AppListBody {
    #[serde(default)]
    response: AppListResponse,
}

#[derive(Debug, Default, Deserialize)]
struct AppListResponse {
    #[serde(default)]
    apps: Vec<AppListItem>,
    #[serde(default)]
    have_more_results: bool,
    #[serde(default)]
    last_appid: Option<EntryId>,
}

#[derive(Debug, Deserialize)]
struct AppListItem {
    appid: EntryId,
}

pub fn parse_app_list(body: &[u8]) -> Result<CatalogPage, SourceError> {
    let parsed: AppListBody = decode_json(body)?;
    let response = parsed.response;
    Ok(CatalogPage {
        ids: response.apps.into_iter().map(|app| app.appid).collect(),
        has_more: response.have_more_results,
        last_id: response.last_appid,
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn selector(raw: &str) -> Result<Selector, SourceError> {
    Selector::parse(raw).map_err(|e| SourceError::Decode(e.to_string()))
}

fn select_first_text(document: &Html, raw: &str) -> Result<Option<String>, SourceError> {
    let sel = selector(raw)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_all_texts(document: &Html, raw: &str) -> Result<Vec<String>, SourceError> {
    let sel = selector(raw)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect())
}

fn select_first_attr(document: &Html, raw: &str, attr: &str) -> Result<Option<String>, SourceError> {
    let sel = selector(raw)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

/// Extracts the descriptive fields from a store page. A page without a
/// title is what Steam serves for region-locked apps.
pub fn parse_store_page(html: &str) -> Result<StorePage, SourceError> {
    let document = Html::parse_document(html);

    let title = select_first_text(&document, "div#appHubAppName")?.ok_or(SourceError::RegionLock)?;
    let description = select_first_attr(&document, r#"meta[name="Description"]"#, "content")?
        .ok_or(SourceError::MissingField("description"))?;
    let header_image = select_first_attr(&document, r#"meta[property="og:image"]"#, "content")?
        .ok_or(SourceError::MissingField("header_image"))?;
    let genres = select_all_texts(
        &document,
        r#"div#genresAndManufacturer > span > a[href^="https://store.steampowered.com/genre"]"#,
    )?;
    if genres.is_empty() {
        debug!(%title, "store page lists no genres");
    }

    Ok(StorePage {
        title,
        description,
        header_image,
        genres,
    })
}

/// Reads `data.<id>.common.steam_release_date` (unix seconds as a string).
pub fn parse_release_info(id: EntryId, body: &[u8]) -> Result<ReleaseInfo, SourceError> {
    let value: serde_json::Value = decode_json(body)?;
    let raw = value
        .get("data")
        .and_then(|data| data.get(id.to_string()))
        .and_then(|app| app.get("common"))
        .and_then(|common| common.get("steam_release_date"));

    let seconds = match raw {
        None | Some(serde_json::Value::Null) => return Ok(ReleaseInfo::default()),
        Some(serde_json::Value::String(text)) => text
            .trim()
            .parse::<i64>()
            .map_err(|e| SourceError::Decode(format!("steam_release_date {text:?}: {e}")))?,
        Some(serde_json::Value::Number(number)) => number
            .as_i64()
            .ok_or_else(|| SourceError::Decode(format!("steam_release_date {number}")))?,
        Some(other) => {
            return Err(SourceError::Decode(format!("steam_release_date {other}")));
        }
    };

    let release_date = DateTime::from_timestamp(seconds, 0)
        .map(|dt| dt.date_naive())
        .ok_or_else(|| SourceError::Decode(format!("steam_release_date {seconds} out of range")))?;
    Ok(ReleaseInfo {
        release_date: Some(release_date),
    })
}

pub fn parse_review_stats(body: &[u8]) -> Result<ReviewStats, SourceError> {
    decode_json(body)
}

#[derive(Debug, Deserialize)]
struct PlayerCountBody {
    response: PlayerCountResponse,
}

#[derive(Debug, Deserialize)]
struct PlayerCountResponse {
    player_count: Option<u64>,
}

pub fn parse_player_count(body: &[u8]) -> Result<u64, SourceError> {
    let parsed: PlayerCountBody = decode_json(body)?;
    parsed
        .response
        .player_count
        .ok_or_else(|| SourceError::Decode("response.player_count missing".into()))
}

/// Base URLs of the upstreams, overridable for mirrors and local testing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SteamEndpoints {
    pub web_api: String,
    pub store: String,
    pub steamcmd: String,
    pub steamspy: String,
}

impl Default for SteamEndpoints {
    fn default() -> Self {
        Self {
            web_api: "https://api.steampowered.com".into(),
            store: "https://store.steampowered.com".into(),
            steamcmd: "https://api.steamcmd.net".into(),
            steamspy: "https://steamspy.com".into(),
        }
    }
}

impl SteamEndpoints {
    pub fn app_list_url(&self, key: &str, cursor: &CatalogCursor, page_size: u32) -> String {
        let mut url = format!(
            "{}/IStoreService/GetAppList/v1/?key={key}&include_games=true&include_dlc=false\
             &include_software=false&include_videos=false&include_hardware=false&max_results={page_size}",
            self.web_api
        );
        if let Some(watermark) = cursor.last_modified_watermark {
            url.push_str(&format!("&if_modified_since={}", watermark.timestamp()));
        }
        if let Some(last_id) = cursor.last_seen_id {
            url.push_str(&format!("&last_appid={last_id}"));
        }
        url
    }

    pub fn store_page_url(&self, id: EntryId) -> String {
        format!("{}/app/{id}", self.store)
    }

    pub fn release_info_url(&self, id: EntryId) -> String {
        format!("{}/v1/info/{id}", self.steamcmd)
    }

    pub fn review_stats_url(&self, id: EntryId) -> String {
        format!("{}/api.php?request=appdetails&appid={id}", self.steamspy)
    }

    pub fn player_count_url(&self, id: EntryId) -> String {
        format!(
            "{}/ISteamUserStats/GetNumberOfCurrentPlayers/v1/?appid={id}",
            self.web_api
        )
    }
}

pub struct HttpCatalogSource {
    http: Arc<HttpFetcher>,
    endpoints: SteamEndpoints,
    steam_key: Option<String>,
}

impl HttpCatalogSource {
    pub fn new(http: Arc<HttpFetcher>, endpoints: SteamEndpoints, steam_key: Option<String>) -> Self {
        Self {
            http,
            endpoints,
            steam_key,
        }
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    fn is_configured(&self) -> bool {
        self.steam_key.as_deref().is_some_and(|key| !key.is_empty())
    }

    async fn fetch_page(&self, cursor: &CatalogCursor) -> Result<CatalogPage, SourceError> {
        let key = self.steam_key.as_deref().unwrap_or_default();
        let url = self.endpoints.app_list_url(key, cursor, DEFAULT_PAGE_SIZE);
        let resp = self.http.get("steam-web-api", &url, &[]).await?;
        check_status(&resp)?;
        parse_app_list(&resp.body)
    }
}

pub struct HttpDetailSource {
    http: Arc<HttpFetcher>,
    endpoints: SteamEndpoints,
}

impl HttpDetailSource {
    pub fn new(http: Arc<HttpFetcher>, endpoints: SteamEndpoints) -> Self {
        Self { http, endpoints }
    }
}

#[async_trait]
impl DetailSource for HttpDetailSource {
    async fn store_page(&self, id: EntryId) -> Result<StorePage, SourceError> {
        let url = self.endpoints.store_page_url(id);
        let resp = self
            .http
            .get(
                "steam-store",
                &url,
                &[("cookie", STORE_COOKIE), ("accept-language", STORE_LANGUAGE)],
            )
            .await?;
        check_status(&resp)?;
        let content_type = resp.content_type.as_deref().unwrap_or_default();
        if !content_type.starts_with("text/html") {
            return Err(SourceError::Decode(format!(
                "expected text/html, got {content_type:?}"
            )));
        }
        parse_store_page(&String::from_utf8_lossy(&resp.body))
    }

    async fn release_info(&self, id: EntryId) -> Result<ReleaseInfo, SourceError> {
        let url = self.endpoints.release_info_url(id);
        let resp = self.http.get("steamcmd", &url, &[]).await?;
        check_status(&resp)?;
        parse_release_info(id, &resp.body)
    }

    async fn review_stats(&self, id: EntryId) -> Result<ReviewStats, SourceError> {
        let url = self.endpoints.review_stats_url(id);
        let resp = self.http.get("steamspy", &url, &[]).await?;
        check_status(&resp)?;
        parse_review_stats(&resp.body)
    }
}

pub struct HttpMetricSource {
    http: Arc<HttpFetcher>,
    endpoints: SteamEndpoints,
}

impl HttpMetricSource {
    pub fn new(http: Arc<HttpFetcher>, endpoints: SteamEndpoints) -> Self {
        Self { http, endpoints }
    }
}

#[async_trait]
impl MetricSource for HttpMetricSource {
    async fn current_value(&self, id: EntryId) -> Result<u64, SourceError> {
        let url = self.endpoints.player_count_url(id);
        let resp = self.http.get("steam-web-api", &url, &[]).await?;
        check_status(&resp)?;
        parse_player_count(&resp.body)
    }
}
