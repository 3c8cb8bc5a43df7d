use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use gavel_core::error::{AppError, FetchError};
use gavel_core::models::{Fields, ListingRef, Source};
use gavel_core::traits::ListingParser;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;

/// Fields parsed as amounts rather than kept as text.
const NUMERIC_FIELDS: [&str; 4] = ["price", "shipping_cost", "seller_rating", "bid_count"];

/// Attributes holding an auction end as epoch milliseconds.
const END_TIME_MILLIS_ATTRS: [&str; 2] = ["timems", "data-timems"];

/// Attributes holding an auction end as an RFC 3339 timestamp.
const END_TIME_ISO_ATTRS: [&str; 2] = ["datetime", "content"];

/// Default eBay item page selectors. Each entry may list fallbacks separated by commas.
const EBAY_SELECTORS: &[(&str, &str)] = &[
    ("title", "h1.x-item-title__mainTitle, h1.it-ttl, h1#itemTitle"),
    ("price", ".x-price-primary .ux-textspans, span#prcIsum, span.prc"),
    ("end_time", ".ux-timer__text, span.vi-tm-left, span.timeMs"),
    ("condition", ".x-item-condition-text .ux-textspans, div#vi-itm-cond"),
    ("seller_rating", ".x-sellercard-atf__data-item .ux-textspans, span.mbg-l a"),
    ("bid_count", ".x-bid-count .ux-textspans, a#vi-VR-bid-lnk span"),
    ("shipping_cost", ".ux-labels-values--shipping .ux-textspans--BOLD, span#fshippingCost"),
    ("brand", "div.ux-labels-values--brand .ux-labels-values__values, div.it-attr[data-name=Brand] span.attr-value"),
    ("model", "div.ux-labels-values--model .ux-labels-values__values, div.it-attr[data-name=Model] span.attr-value"),
    ("upc", "div.ux-labels-values--upc .ux-labels-values__values"),
    ("location", ".ux-labels-values--itemLocation .ux-textspans, div.iti-eu-bld-gry span"),
];

/// Microdata-first selectors for auction houses without a dedicated profile.
const GENERIC_SELECTORS: &[(&str, &str)] = &[
    ("title", "[itemprop=name], h1"),
    ("price", "[itemprop=price], .current-bid, .price"),
    ("end_time", "[itemprop=availabilityEnds], .end-time, time"),
    ("condition", "[itemprop=itemCondition], .condition"),
    ("bid_count", ".bid-count"),
    ("shipping_cost", ".shipping-cost"),
    ("brand", "[itemprop=brand]"),
    ("model", "[itemprop=model]"),
    ("upc", "[itemprop=gtin12], [itemprop=gtin13]"),
    ("location", ".location"),
];

/// Compiled CSS selectors for one source, keyed by field name.
#[derive(Debug, Clone)]
pub struct SelectorProfile {
    selectors: BTreeMap<String, Selector>,
}

impl SelectorProfile {
    /// Compile a profile. `title` and `price` selectors are mandatory.
    pub fn new<I, K, V>(selectors: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut compiled = BTreeMap::new();
        for (field, css) in selectors {
            let field = field.into();
            let selector = Selector::parse(css.as_ref()).map_err(|e| {
                AppError::ConfigError(format!("invalid selector for field '{field}': {e}"))
            })?;
            compiled.insert(field, selector);
        }
        for required in ["title", "price"] {
            if !compiled.contains_key(required) {
                return Err(AppError::ConfigError(format!(
                    "selector profile has no '{required}' selector"
                )));
            }
        }
        Ok(Self {
            selectors: compiled,
        })
    }

    pub fn ebay() -> Result<Self, AppError> {
        Self::new(EBAY_SELECTORS.iter().copied())
    }

    pub fn generic() -> Result<Self, AppError> {
        Self::new(GENERIC_SELECTORS.iter().copied())
    }

    /// Replace or add selectors on top of this profile.
    pub fn merged<I, K, V>(&self, overrides: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut selectors = self.selectors.clone();
        for (field, css) in overrides {
            let field = field.into();
            let selector = Selector::parse(css.as_ref()).map_err(|e| {
                AppError::ConfigError(format!("invalid selector for field '{field}': {e}"))
            })?;
            selectors.insert(field, selector);
        }
        Ok(Self { selectors })
    }
}

/// Listing page parser driven by per-source CSS selector profiles.
#[derive(Debug, Clone)]
pub struct HtmlListingParser {
    profiles: Arc<HashMap<Source, SelectorProfile>>,
    fallback: Arc<SelectorProfile>,
}

impl HtmlListingParser {
    /// eBay profile for `ebay`, the generic profile for everything else.
    pub fn new() -> Result<Self, AppError> {
        let mut profiles = HashMap::new();
        profiles.insert(Source::Ebay, SelectorProfile::ebay()?);
        Ok(Self {
            profiles: Arc::new(profiles),
            fallback: Arc::new(SelectorProfile::generic()?),
        })
    }

    pub fn with_profile(mut self, source: Source, profile: SelectorProfile) -> Self {
        Arc::make_mut(&mut self.profiles).insert(source, profile);
        self
    }

    /// Apply field selector overrides to the profile currently used for `source`.
    pub fn with_overrides(
        self,
        source: Source,
        overrides: &BTreeMap<String, String>,
    ) -> Result<Self, AppError> {
        if overrides.is_empty() {
            return Ok(self);
        }
        let merged = self.profile(source).merged(overrides.iter())?;
        Ok(self.with_profile(source, merged))
    }

    fn profile(&self, source: Source) -> &SelectorProfile {
        self.profiles.get(&source).unwrap_or(&self.fallback)
    }
}

impl ListingParser for HtmlListingParser {
    fn parse(
        &self,
        listing: &ListingRef,
        body: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Fields, FetchError> {
        let document = Html::parse_document(body);
        let mut fields = Fields::new();

        for (field, selector) in &self.profile(listing.source).selectors {
            if field == "end_time" {
                if let Some(end) = document
                    .select(selector)
                    .find_map(|el| end_time_value(el, fetched_at))
                {
                    fields.insert(field.clone(), Value::String(end));
                }
                continue;
            }
            let Some(text) = document.select(selector).find_map(element_text) else {
                continue;
            };
            if NUMERIC_FIELDS.contains(&field.as_str()) {
                if let Some(amount) = parse_amount(&text) {
                    fields.insert(field.clone(), Value::from(amount));
                }
            } else {
                fields.insert(field.clone(), Value::String(text));
            }
        }

        if !fields.contains_key("title") {
            return Err(FetchError::malformed(format!(
                "{}: no title found",
                listing.url
            )));
        }
        if !fields.contains_key("price") {
            return Err(FetchError::malformed(format!(
                "{}: no price found",
                listing.url
            )));
        }
        Ok(fields)
    }
}

/// Trimmed, whitespace-collapsed text of an element, or its `content`
/// attribute for empty `<meta>`-style elements.
fn element_text(element: ElementRef<'_>) -> Option<String> {
    let text = element.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if !text.is_empty() {
        return Some(text);
    }
    element
        .value()
        .attr("content")
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

/// Auction end as an absolute UTC timestamp string.
///
/// Epoch and ISO attributes are taken as-is. A countdown such as
/// `"Ends in 2d 3h 10m"` is added to `fetched_at` and rounded to the minute,
/// so refetching a live listing yields the same value. Other text is kept
/// verbatim.
fn end_time_value(element: ElementRef<'_>, fetched_at: DateTime<Utc>) -> Option<String> {
    let attrs = element.value();
    let from_millis = END_TIME_MILLIS_ATTRS
        .iter()
        .filter_map(|name| attrs.attr(name))
        .find_map(|v| v.trim().parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis);
    let from_iso = || {
        END_TIME_ISO_ATTRS
            .iter()
            .filter_map(|name| attrs.attr(name))
            .find_map(|v| DateTime::parse_from_rfc3339(v.trim()).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };
    if let Some(end) = from_millis.or_else(from_iso) {
        return Some(format_end_time(end));
    }

    let text = element_text(element)?;
    if let Ok(end) = DateTime::parse_from_rfc3339(&text) {
        return Some(format_end_time(end.with_timezone(&Utc)));
    }
    match parse_countdown(&text) {
        Some(remaining) => {
            let end = fetched_at + remaining;
            let minute = (end.timestamp() + 30).div_euclid(60) * 60;
            DateTime::from_timestamp(minute, 0).map(format_end_time)
        }
        None => Some(text),
    }
}

fn format_end_time(end: DateTime<Utc>) -> String {
    end.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Sum of `<number><unit>` pairs (days, hours, minutes, seconds) in `text`.
///
/// `None` when no pair is found, e.g. for an absolute date.
pub fn parse_countdown(text: &str) -> Option<TimeDelta> {
    let mut spaced = String::with_capacity(text.len() + 8);
    let mut prev: Option<char> = None;
    for c in text.to_lowercase().chars() {
        let c = if c.is_alphanumeric() { c } else { ' ' };
        if let Some(p) = prev {
            if (p.is_ascii_digit() && c.is_alphabetic()) || (p.is_alphabetic() && c.is_ascii_digit()) {
                spaced.push(' ');
            }
        }
        spaced.push(c);
        prev = Some(c);
    }

    let tokens: Vec<&str> = spaced.split_whitespace().collect();
    let mut total = 0i64;
    let mut matched = false;
    for pair in tokens.windows(2) {
        let Ok(n) = pair[0].parse::<i64>() else {
            continue;
        };
        let unit_secs = match pair[1] {
            "d" | "day" | "days" => 86_400,
            "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
            "m" | "min" | "mins" | "minute" | "minutes" => 60,
            "s" | "sec" | "secs" | "second" | "seconds" => 1,
            _ => continue,
        };
        total = total.checked_add(n.checked_mul(unit_secs)?)?;
        matched = true;
    }
    matched.then(|| TimeDelta::try_seconds(total)).flatten()
}

/// Keep digits and the decimal point, then parse.
///
/// `"US $1,234.50"` becomes `1234.5`; text without digits (`"Free"`) is `None`.
pub fn parse_amount(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gavel_core::error::ErrorKind;
    use gavel_core::models::ListingSnapshot;
    use serde_json::json;

    const EBAY_PAGE: &str = r#"
        <html><body>
          <h1 class="x-item-title__mainTitle"><span class="ux-textspans">Vintage
            Leica M3 Camera</span></h1>
          <div class="x-price-primary"><span class="ux-textspans">US $1,234.50</span></div>
          <div class="x-bid-count"><span class="ux-textspans">17 bids</span></div>
          <div class="ux-labels-values--shipping"><span class="ux-textspans--BOLD">Free</span></div>
          <div class="x-item-condition-text"><span class="ux-textspans">Used</span></div>
          <div class="ux-labels-values--brand"><div class="ux-labels-values__values">Leica</div></div>
        </body></html>
    "#;

    fn now() -> DateTime<Utc> {
        "2026-03-01T12:00:20Z".parse().unwrap()
    }

    fn ebay_page_with_timer(timer: &str) -> String {
        EBAY_PAGE.replace(
            "</body>",
            &format!("<span class=\"ux-timer__text\">{timer}</span></body>"),
        )
    }

    fn ebay_listing() -> ListingRef {
        ListingRef::new(Source::Ebay, "1234", "https://www.ebay.com/itm/1234")
    }

    #[test]
    fn parses_ebay_item_page() {
        let parser = HtmlListingParser::new().unwrap();
        let fields = parser.parse(&ebay_listing(), EBAY_PAGE, now()).unwrap();

        assert_eq!(fields["title"], json!("Vintage Leica M3 Camera"));
        assert_eq!(fields["price"], json!(1234.5));
        assert_eq!(fields["bid_count"], json!(17.0));
        assert_eq!(fields["condition"], json!("Used"));
        assert_eq!(fields["brand"], json!("Leica"));
        // "Free" has no amount.
        assert!(!fields.contains_key("shipping_cost"));
    }

    #[test]
    fn generic_profile_reads_microdata() {
        let page = r#"
            <h1>Estate lot 44</h1>
            <meta itemprop="price" content="85.00">
            <span class="shipping-cost">$12</span>
        "#;
        let parser = HtmlListingParser::new().unwrap();
        let listing = ListingRef::new(Source::Local, "44", "https://auctions.example/lot/44");
        let fields = parser.parse(&listing, page, now()).unwrap();

        assert_eq!(fields["title"], json!("Estate lot 44"));
        assert_eq!(fields["price"], json!(85.0));
        assert_eq!(fields["shipping_cost"], json!(12.0));
    }

    #[test]
    fn missing_price_is_malformed() {
        let parser = HtmlListingParser::new().unwrap();
        let err = parser
            .parse(&ebay_listing(), "<h1 class=\"it-ttl\">Lamp</h1>", now())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Malformed);
        assert!(err.message.contains("price"));
    }

    #[test]
    fn missing_title_is_malformed() {
        let parser = HtmlListingParser::new().unwrap();
        let err = parser
            .parse(&ebay_listing(), "<span class=\"prc\">$5</span>", now())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Malformed);
    }

    #[test]
    fn overrides_replace_single_fields() {
        let overrides = BTreeMap::from([("title".to_string(), "div.lot-title".to_string())]);
        let parser = HtmlListingParser::new()
            .unwrap()
            .with_overrides(Source::Local, &overrides)
            .unwrap();
        let listing = ListingRef::new(Source::Local, "7", "https://auctions.example/lot/7");
        let fields = parser
            .parse(
                &listing,
                "<div class=\"lot-title\">Chair</div><span class=\"price\">$40</span>",
                now(),
            )
            .unwrap();
        assert_eq!(fields["title"], json!("Chair"));
    }

    #[test]
    fn invalid_selector_is_config_error() {
        let err = SelectorProfile::new([("title", "h1[["), ("price", ".p")]).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn profile_requires_title_and_price() {
        let err = SelectorProfile::new([("title", "h1")]).unwrap_err();
        assert!(err.to_string().contains("price"));
    }

    #[test]
    fn amount_cleaning() {
        assert_eq!(parse_amount("US $1,234.50"), Some(1234.5));
        assert_eq!(parse_amount("€ 99"), Some(99.0));
        assert_eq!(parse_amount("99.2% positive"), Some(99.2));
        assert_eq!(parse_amount("Free"), None);
        assert_eq!(parse_amount("1.2.3"), None);
    }

    #[test]
    fn countdown_refetched_a_minute_later_hashes_equal() {
        let parser = HtmlListingParser::new().unwrap();
        let first_at = now();
        let second_at = first_at + TimeDelta::seconds(60);

        let first = parser
            .parse(&ebay_listing(), &ebay_page_with_timer("Ends in 2d 3h 10m"), first_at)
            .unwrap();
        let second = parser
            .parse(&ebay_listing(), &ebay_page_with_timer("Ends in 2d 3h 9m"), second_at)
            .unwrap();

        assert_eq!(first["end_time"], json!("2026-03-03T15:10:00Z"));
        assert_eq!(first, second);
        let a = ListingSnapshot::fetched(ebay_listing(), first, 100, first_at);
        let b = ListingSnapshot::fetched(ebay_listing(), second, 120, second_at);
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn end_time_prefers_absolute_attributes() {
        let parser = HtmlListingParser::new().unwrap();
        let page = EBAY_PAGE.replace(
            "</body>",
            "<span class=\"timeMs\" timems=\"1772539800000\">2d 3h</span></body>",
        );
        let fields = parser.parse(&ebay_listing(), &page, now()).unwrap();
        assert_eq!(fields["end_time"], json!("2026-03-03T12:10:00Z"));

        let listing = ListingRef::new(Source::Local, "9", "https://auctions.example/lot/9");
        let page = r#"<h1>Clock</h1><span class="price">$10</span>
            <time datetime="2026-03-05T18:00:00+01:00">Thursday evening</time>"#;
        let fields = parser.parse(&listing, page, now()).unwrap();
        assert_eq!(fields["end_time"], json!("2026-03-05T17:00:00Z"));
    }

    #[test]
    fn absolute_end_text_is_kept() {
        let parser = HtmlListingParser::new().unwrap();
        let page = ebay_page_with_timer("Sun, Mar 08 18:30 PST");
        let fields = parser.parse(&ebay_listing(), &page, now()).unwrap();
        assert_eq!(fields["end_time"], json!("Sun, Mar 08 18:30 PST"));
    }

    #[test]
    fn countdown_units() {
        assert_eq!(parse_countdown("Ends in 2d 3h"), Some(TimeDelta::seconds(183_600)));
        assert_eq!(parse_countdown("1 day 4 hours"), Some(TimeDelta::seconds(100_800)));
        assert_eq!(parse_countdown("45m 10s left"), Some(TimeDelta::seconds(2_710)));
        assert_eq!(parse_countdown("Sun, Mar 08 18:30"), None);
    }
}
