pub mod availability;
pub mod cleaner;
pub mod directory;
pub mod http_client;
pub mod parsers;

use crate::config::ScraperConfig;
use crate::error::FetchError;
use async_trait::async_trait;

use self::http_client::HttpClient;

pub use self::availability::fetch_availability;
pub use self::directory::scan_facilities;

// ── Source trait ──────────────────────────────────────────────────────────────

/// Raw page access to a reservation site. Crawl logic only sees payload text.
#[async_trait]
pub trait ReservationSource: Send + Sync + 'static {
    /// Base against which listing links are resolved.
    fn base_url(&self) -> &str;

    /// HTML of listing page `page` (1-based).
    async fn fetch_listing_page(&self, page: u32) -> Result<String, FetchError>;

    /// JSON time table of one facility on one `YYYYMMDD` date.
    async fn fetch_time_table(&self, facility_id: &str, date: &str) -> Result<String, FetchError>;
}

// ── Public sports reservation site ────────────────────────────────────────────

const LISTING_PATH: &str = "/publicsports/sports/selectFcltyRceptResveListU.do";
const TIME_TABLE_PATH: &str =
    "/publicsports/sports/selectRegistTimeByChosenDateFcltyRceptResveApply.do";

pub struct PublicSportsSource {
    client: HttpClient,
    base_url: String,
    listing_key: String,
    page_unit: String,
}

impl PublicSportsSource {
    pub fn new(config: &ScraperConfig, concurrency: usize) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: HttpClient::new(config, concurrency)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            listing_key: config.listing_key.clone(),
            page_unit: config.page_unit.to_string(),
        })
    }

    fn listing_url(&self) -> String {
        format!("{}{}", self.base_url, LISTING_PATH)
    }

    fn time_table_url(&self) -> String {
        format!("{}{}", self.base_url, TIME_TABLE_PATH)
    }
}

#[async_trait]
impl ReservationSource for PublicSportsSource {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch_listing_page(&self, page: u32) -> Result<String, FetchError> {
        let page = page.to_string();
        self.client
            .get_text(
                &self.listing_url(),
                &[
                    ("key", self.listing_key.as_str()),
                    ("pageUnit", self.page_unit.as_str()),
                    ("checkSearchMonthNow", "false"),
                    ("pageIndex", page.as_str()),
                ],
            )
            .await
    }

    async fn fetch_time_table(&self, facility_id: &str, date: &str) -> Result<String, FetchError> {
        self.client
            .post_form(&self.time_table_url(), &[("dateVal", date), ("resveId", facility_id)])
            .await
    }
}

// ── Test double ───────────────────────────────────────────────────────────────
