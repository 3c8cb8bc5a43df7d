pub mod discovery;
pub mod fetcher;
pub mod parser;
pub mod scoring;

#[cfg(test)]
mod test_server;

use std::str::FromStr;

use gavel_core::config::PipelineConfig;
use gavel_core::error::AppError;
use gavel_core::models::Source;

pub use discovery::{HttpDiscoverySource, SearchProfile};
pub use fetcher::HttpPageFetcher;
pub use parser::{HtmlListingParser, SelectorProfile};
pub use scoring::{HttpShippingEstimator, HttpValuePredictor};

fn source_name(name: &str) -> Result<Source, AppError> {
    Source::from_str(name).map_err(|e| AppError::ConfigError(format!("[sources.{name}]: {e}")))
}

/// Listing parser with the `[sources.*.selectors]` overrides applied.
pub fn listing_parser(config: &PipelineConfig) -> Result<HtmlListingParser, AppError> {
    let mut parser = HtmlListingParser::new()?;
    for (name, section) in &config.sources {
        parser = parser.with_overrides(source_name(name)?, &section.selectors)?;
    }
    Ok(parser)
}

/// Discovery source with the `[sources.*]` search URLs and link selectors applied.
pub fn discovery_source(config: &PipelineConfig) -> Result<HttpDiscoverySource, AppError> {
    let mut discovery = HttpDiscoverySource::with_timeout(config.fetch_timeout())?;
    for (name, section) in &config.sources {
        let source = source_name(name)?;
        let defaults = match source {
            Source::Ebay => Some(SearchProfile::ebay()?),
            _ => None,
        };
        let url_template = section
            .search_url
            .clone()
            .or_else(|| defaults.as_ref().map(|d| d.url_template.clone()));
        let Some(url_template) = url_template else {
            if section.link_selector.is_some() {
                return Err(AppError::ConfigError(format!(
                    "[sources.{name}] has a link_selector but no search_url"
                )));
            }
            continue;
        };
        let profile = match (&section.link_selector, defaults) {
            (Some(selector), _) => SearchProfile::new(url_template, selector)?,
            (None, Some(d)) => SearchProfile {
                url_template,
                link_selector: d.link_selector,
            },
            (None, None) => SearchProfile::new(url_template, "a[href]")?,
        };
        discovery = discovery.with_profile(source, profile);
    }
    Ok(discovery)
}
