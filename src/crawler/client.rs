//! Marketplace API client
//!
//! The engine talks to the remote site through the [`StayApi`] trait so that
//! sweeps can run against a scripted implementation in tests. The production
//! implementation drives the marketplace's private GraphQL surface over
//! persisted queries: search (listings around a coordinate), per-listing
//! availability calendars, and listing detail sections.
//!
//! The HTTP boundary carries a hard requests-per-second ceiling; all adaptive
//! pacing lives in the governor and is enforced by the scheduler before a
//! request ever reaches this client.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER, USER_AGENT};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::config::{ApiConfig, CrawlConfig};
use crate::crawler::governor::RateGovernor;
use crate::error::FetchError;
use crate::models::{Listing, StayWindow, Target};

/// GraphQL operation names
const SEARCH_OPERATION: &str = "StaysSearch";
const CALENDAR_OPERATION: &str = "PdpAvailabilityCalendar";
const DETAIL_OPERATION: &str = "StaysPdpSections";

/// Collaborator interface to the remote marketplace
#[async_trait]
pub trait StayApi: Send + Sync {
    /// Search listings around a target's coordinates for a stay window
    async fn fetch_search(&self, target: &Target, window: &StayWindow) -> Result<Value, FetchError>;

    /// Fetch `months` months of availability calendar starting at year/month
    async fn fetch_calendar(
        &self,
        listing: &Listing,
        year: i32,
        month: u32,
        months: u32,
    ) -> Result<Value, FetchError>;

    /// Fetch listing detail sections
    async fn fetch_detail(&self, listing: &Listing) -> Result<Value, FetchError>;
}

/// Extract the host component used as the governor key
pub fn host_of(base_url: &str) -> Result<String, FetchError> {
    Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(String::from))
        .ok_or_else(|| FetchError::InvalidUrl(base_url.to_string()))
}

/// HTTP implementation of [`StayApi`]
pub struct HttpStayApi {
    api: ApiConfig,
    crawl: CrawlConfig,
    governor: Arc<RateGovernor>,
    /// Hard ceiling on request rate, below which the governor paces
    ceiling: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    /// reqwest pins the proxy at client construction, so one client is kept
    /// per proxy (empty key = direct)
    clients: Mutex<HashMap<String, Client>>,
}

impl HttpStayApi {
    pub fn new(
        api: ApiConfig,
        crawl: CrawlConfig,
        governor: Arc<RateGovernor>,
    ) -> Result<Self, FetchError> {
        let rate = NonZeroU32::new(api.requests_per_second).unwrap_or(NonZeroU32::new(1).unwrap());
        let ceiling = RateLimiter::direct(Quota::per_second(rate));
        Ok(Self {
            api,
            crawl,
            governor,
            ceiling,
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// The governor key for this API's host
    pub fn host(&self) -> Result<String, FetchError> {
        host_of(&self.api.base_url)
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<Client, FetchError> {
        let key = proxy.unwrap_or("").to_string();
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .timeout(Duration::from_secs(self.crawl.request_timeout_secs))
            .gzip(true)
            .cookie_store(true);
        if let Some(proxy_url) = proxy {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|_| FetchError::InvalidUrl(proxy_url.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build()?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    fn hash_for(&self, operation: &str) -> &str {
        match operation {
            SEARCH_OPERATION => &self.api.search_hash,
            CALENDAR_OPERATION => &self.api.calendar_hash,
            _ => &self.api.detail_hash,
        }
    }

    async fn get_operation(&self, operation: &str, variables: Value) -> Result<Value, FetchError> {
        self.ceiling.until_ready().await;

        let identity = self.governor.identity();
        let client = self.client_for(identity.proxy.as_deref())?;

        let url = format!(
            "{}/api/v3/{}",
            self.api.base_url.trim_end_matches('/'),
            operation
        );
        let extensions = json!({
            "persistedQuery": { "version": 1, "sha256Hash": self.hash_for(operation) }
        });
        let params = [
            ("operationName", operation.to_string()),
            ("locale", self.api.locale.clone()),
            ("currency", self.api.currency.clone()),
            ("variables", variables.to_string()),
            ("extensions", extensions.to_string()),
        ];
        let headers = self.build_headers(&identity.user_agent);

        let response = client
            .get(&url)
            .headers(headers)
            .query(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Http(e)
                }
            })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Http(e)
            }
        })?;

        if let Some(kind) = RateGovernor::detect_block(status, &text) {
            return Err(FetchError::Blocked(kind));
        }
        if !(200..300).contains(&status) {
            return Err(FetchError::Status(status));
        }

        serde_json::from_str(&text).map_err(|e| FetchError::Decode(e.to_string()))
    }

    /// Browser-profile headers for the API surface
    fn build_headers(&self, user_agent: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let Ok(value) = HeaderValue::from_str(user_agent) {
            headers.insert(USER_AGENT, value);
        }
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("ko-KR,ko;q=0.9,en;q=0.8"),
        );
        if let Ok(value) = HeaderValue::from_str(&self.api.api_key) {
            headers.insert(HeaderName::from_static("x-airbnb-api-key"), value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.api.currency) {
            headers.insert(HeaderName::from_static("x-airbnb-currency"), value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.api.locale) {
            headers.insert(HeaderName::from_static("x-airbnb-locale"), value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!("{}/s/homes", self.api.base_url)) {
            headers.insert(REFERER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.api.base_url) {
            headers.insert(HeaderName::from_static("origin"), value);
        }

        // Sec-Fetch headers for AJAX requests
        headers.insert(
            HeaderName::from_static("sec-fetch-dest"),
            HeaderValue::from_static("empty"),
        );
        headers.insert(
            HeaderName::from_static("sec-fetch-mode"),
            HeaderValue::from_static("cors"),
        );
        headers.insert(
            HeaderName::from_static("sec-fetch-site"),
            HeaderValue::from_static("same-origin"),
        );

        headers
    }
}

#[async_trait]
impl StayApi for HttpStayApi {
    async fn fetch_search(&self, target: &Target, window: &StayWindow) -> Result<Value, FetchError> {
        // Convert the search radius to rough lat/lng offsets (Seoul latitude)
        let lat_offset = self.crawl.search_radius_km / 111.0;
        let lng_offset = self.crawl.search_radius_km / (111.0 * 0.85);

        let raw_params = json!([
            { "filterName": "adults", "filterValues": [self.crawl.default_guests.to_string()] },
            { "filterName": "checkin", "filterValues": [window.checkin.to_string()] },
            { "filterName": "checkout", "filterValues": [window.checkout.to_string()] },
            { "filterName": "ne_lat", "filterValues": [(target.latitude + lat_offset).to_string()] },
            { "filterName": "ne_lng", "filterValues": [(target.longitude + lng_offset).to_string()] },
            { "filterName": "sw_lat", "filterValues": [(target.latitude - lat_offset).to_string()] },
            { "filterName": "sw_lng", "filterValues": [(target.longitude - lng_offset).to_string()] },
            { "filterName": "refinementPaths", "filterValues": ["/homes"] },
            { "filterName": "tabId", "filterValues": ["home_tab"] },
            { "filterName": "search_type", "filterValues": ["filter_change"] },
        ]);

        let variables = json!({
            "staysSearchRequest": {
                "metadataOnly": false,
                "rawParams": raw_params,
                "requestedPageType": "STAYS_SEARCH",
            },
        });

        self.get_operation(SEARCH_OPERATION, variables).await
    }

    async fn fetch_calendar(
        &self,
        listing: &Listing,
        year: i32,
        month: u32,
        months: u32,
    ) -> Result<Value, FetchError> {
        let variables = json!({
            "request": {
                "count": months,
                "listingId": listing.market_id,
                "month": month,
                "year": year,
            },
        });
        self.get_operation(CALENDAR_OPERATION, variables).await
    }

    async fn fetch_detail(&self, listing: &Listing) -> Result<Value, FetchError> {
        let stay_id = BASE64.encode(format!("StayListing:{}", listing.market_id));
        let demand_id = BASE64.encode(format!("DemandStayListing:{}", listing.market_id));

        let variables = json!({
            "id": stay_id,
            "demandStayListingId": demand_id,
            "pdpSectionsRequest": {
                "adults": self.crawl.default_guests.to_string(),
                "layouts": ["SIDEBAR", "SINGLE_COLUMN"],
            },
        });
        self.get_operation(DETAIL_OPERATION, variables).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GovernorConfig, IdentityConfig};
    use crate::crawler::identity::IdentityPool;
    use crate::utils::SystemClock;

    fn test_api(base_url: &str) -> HttpStayApi {
        let clock = Arc::new(SystemClock);
        let identities = IdentityPool::new(
            vec!["test-agent".to_string()],
            &IdentityConfig::default(),
            clock.clone(),
        );
        let governor = Arc::new(RateGovernor::new(
            GovernorConfig::default(),
            identities,
            clock,
        ));
        let api = ApiConfig {
            base_url: base_url.to_string(),
            api_key: "test-key".to_string(),
            requests_per_second: 100,
            ..ApiConfig::default()
        };
        HttpStayApi::new(api, CrawlConfig::default(), governor).unwrap()
    }

    #[test]
    fn test_host_extraction() {
        assert_eq!(
            host_of("https://www.airbnb.co.kr").unwrap(),
            "www.airbnb.co.kr"
        );
        assert!(host_of("not a url").is_err());
    }

    #[test]
    fn test_build_headers() {
        let api = test_api("https://www.example.com");
        let headers = api.build_headers("test-agent");

        assert_eq!(headers.get(USER_AGENT).unwrap(), "test-agent");
        assert_eq!(headers.get(ACCEPT).unwrap(), "application/json");
        assert_eq!(headers.get("x-airbnb-api-key").unwrap(), "test-key");
        assert_eq!(headers.get("x-airbnb-currency").unwrap(), "KRW");
        assert_eq!(
            headers.get(REFERER).unwrap(),
            "https://www.example.com/s/homes"
        );
        assert_eq!(headers.get("sec-fetch-mode").unwrap(), "cors");
    }

    #[test]
    fn test_clients_cached_per_proxy() {
        let api = test_api("https://www.example.com");
        let _ = api.client_for(None).unwrap();
        let _ = api.client_for(None).unwrap();
        let _ = api.client_for(Some("http://127.0.0.1:9999")).unwrap();
        assert_eq!(api.clients.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_proxy_url_rejected() {
        let api = test_api("https://www.example.com");
        assert!(matches!(
            api.client_for(Some("::::")),
            Err(FetchError::InvalidUrl(_))
        ));
    }
}
