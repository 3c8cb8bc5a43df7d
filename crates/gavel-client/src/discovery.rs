use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use gavel_core::error::AppError;
use gavel_core::fetch::classify_response;
use gavel_core::models::{ListingRef, Source};
use gavel_core::rate_governor::RateGovernor;
use gavel_core::scheduler::DiscoveryTarget;
use gavel_core::traits::DiscoverySource;
use gavel_core::util::domain_key;
use reqwest::Client;
use scraper::{Html, Selector};
use url::Url;

const DISCOVERY_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const EBAY_SEARCH_URL: &str = "https://www.ebay.com/sch/i.html?_nkw={q}&LH_Auction=1&_pgn={page}";
const EBAY_LINK_SELECTOR: &str = "li.s-item a.s-item__link, div.s-card a.su-link";

/// Where and how to read one source's search result pages.
#[derive(Debug, Clone)]
pub struct SearchProfile {
    /// URL with a `{page}` placeholder and one `{name}` placeholder per
    /// search parameter. Values are URL-encoded on substitution.
    pub url_template: String,
    pub link_selector: Selector,
}

impl SearchProfile {
    pub fn new(url_template: impl Into<String>, link_selector: &str) -> Result<Self, AppError> {
        let url_template = url_template.into();
        if !url_template.contains("{page}") {
            return Err(AppError::ConfigError(format!(
                "search URL '{url_template}' has no {{page}} placeholder"
            )));
        }
        let link_selector = Selector::parse(link_selector).map_err(|e| {
            AppError::ConfigError(format!("invalid link selector '{link_selector}': {e}"))
        })?;
        Ok(Self {
            url_template,
            link_selector,
        })
    }

    pub fn ebay() -> Result<Self, AppError> {
        Self::new(EBAY_SEARCH_URL, EBAY_LINK_SELECTOR)
    }

    /// Build the result page URL for `target`.
    ///
    /// Placeholders without a matching parameter are left empty.
    pub fn page_url(&self, target: &DiscoveryTarget, page: u32) -> Result<Url, AppError> {
        let mut url = self.url_template.replace("{page}", &page.to_string());
        for (name, value) in &target.search_params {
            let encoded: String = url::form_urlencoded::byte_serialize(value.as_bytes()).collect();
            url = url.replace(&format!("{{{name}}}"), &encoded);
        }
        let url = strip_placeholders(&url);
        Url::parse(&url).map_err(|e| AppError::ConfigError(format!("invalid search URL '{url}': {e}")))
    }
}

/// Discovery source that reads search/category result pages over HTTP.
///
/// With a governor attached, each page request first takes a token from the
/// page's domain bucket, the same one listing fetches draw from.
#[derive(Clone)]
pub struct HttpDiscoverySource {
    client: Client,
    profiles: Arc<HashMap<Source, SearchProfile>>,
    governor: Option<RateGovernor>,
}

impl HttpDiscoverySource {
    /// Source with the built-in eBay profile.
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(DISCOVERY_USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        let mut profiles = HashMap::new();
        profiles.insert(Source::Ebay, SearchProfile::ebay()?);
        Ok(Self {
            client,
            profiles: Arc::new(profiles),
            governor: None,
        })
    }

    pub fn with_governor(mut self, governor: RateGovernor) -> Self {
        self.governor = Some(governor);
        self
    }

    pub fn with_profile(mut self, source: Source, profile: SearchProfile) -> Self {
        Arc::make_mut(&mut self.profiles).insert(source, profile);
        self
    }

    fn profile(&self, source: Source) -> Result<&SearchProfile, AppError> {
        self.profiles.get(&source).ok_or_else(|| {
            AppError::ConfigError(format!("no search URL configured for source '{source}'"))
        })
    }
}

impl DiscoverySource for HttpDiscoverySource {
    async fn discover_page(
        &self,
        target: &DiscoveryTarget,
        page: u32,
    ) -> Result<Vec<ListingRef>, AppError> {
        let profile = self.profile(target.source)?;
        let url = profile.page_url(target, page)?;

        if let Some(governor) = &self.governor {
            let domain = domain_key(url.as_str()).ok_or_else(|| {
                AppError::ConfigError(format!("search URL '{url}' has no host"))
            })?;
            let waited = governor.acquire(&domain).await;
            if !waited.is_zero() {
                tracing::debug!(%domain, wait_ms = %waited.as_millis(), "Result page throttled");
            }
        }

        tracing::debug!(source = %target.source, page, %url, "Requesting result page");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| AppError::HttpError(format!("{url}: {e}")))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::HttpError(format!("{url}: failed to read body: {e}")))?;
        classify_response(status, &body).map_err(|e| AppError::HttpError(format!("{url}: {e}")))?;

        let refs = extract_listing_refs(target.source, &url, &body, &profile.link_selector);
        tracing::debug!(source = %target.source, page, found = refs.len(), "Parsed result page");
        Ok(refs)
    }
    fn share_rate_governor(&mut self, governor: RateGovernor) {
        self.governor = Some(governor);
    }
}

/// Listing references linked from a result page, in page order, each
/// external id at most once.
pub fn extract_listing_refs(
    source: Source,
    page_url: &Url,
    html: &str,
    link_selector: &Selector,
) -> Vec<ListingRef> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    document
        .select(link_selector)
        .filter_map(|link| link.value().attr("href"))
        .filter_map(|href| page_url.join(href).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .filter_map(|mut url| {
            let id = external_id(&url)?;
            url.set_fragment(None);
            url.set_query(None);
            Some((id, url))
        })
        .filter(|(id, _)| seen.insert(id.clone()))
        .map(|(id, url)| ListingRef::new(source, id, url.as_str()))
        .collect()
}

/// Last non-empty path segment, e.g. `1234` for `/itm/lamp/1234?hash=x`.
fn external_id(url: &Url) -> Option<String> {
    url.path_segments()?
        .rev()
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

fn strip_placeholders(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    let mut rest = url;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        rest = &rest[start + len + 1..];
    }
    out.push_str(rest);
    out
}
