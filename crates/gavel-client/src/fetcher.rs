use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gavel_core::error::FetchError;
use gavel_core::rotator::IdentityLease;
use gavel_core::traits::{FetchedPage, PageFetcher};
use gavel_core::util::lock_or_recover;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, COOKIE, HeaderMap, SET_COOKIE, USER_AGENT};
use reqwest::{Client, Proxy};

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// HTTP page fetcher using reqwest.
///
/// Each identity's requests leave through that identity's proxy with its
/// user agent and cookies. One client is built per proxy endpoint and reused,
/// so connection pools are never shared between egress paths.
#[derive(Clone)]
pub struct HttpPageFetcher {
    clients: Arc<Mutex<HashMap<Option<String>, Client>>>,
    timeout: Duration,
}

impl HttpPageFetcher {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Per-request timeout. The fetch worker applies its own hard timeout on top.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<Client, FetchError> {
        let key = proxy.map(str::to_string);
        let mut clients = lock_or_recover(&self.clients, "http clients");
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder().timeout(self.timeout);
        if let Some(endpoint) = proxy {
            let proxy = Proxy::all(endpoint)
                .map_err(|e| FetchError::transient(format!("invalid proxy {endpoint}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| FetchError::transient(format!("cannot build HTTP client: {e}")))?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for HttpPageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str, identity: &IdentityLease) -> Result<FetchedPage, FetchError> {
        let client = self.client_for(identity.proxy_endpoint.as_deref())?;

        let mut request = client
            .get(url)
            .header(USER_AGENT, &identity.user_agent)
            .header(ACCEPT, ACCEPT_HTML)
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.5");
        if let Some(cookies) = &identity.cookies {
            request = request.header(COOKIE, cookies);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::transient(format!("request timed out: {e}"))
            } else if e.is_connect() {
                FetchError::transient(format!("connection failed: {e}"))
            } else {
                FetchError::transient(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let cookies = merge_cookies(identity.cookies.as_deref(), response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::transient(format!("failed to read response body: {e}")))?;

        tracing::debug!(%url, status, bytes = body.len(), identity = %identity.id, "Fetched page");
        Ok(FetchedPage {
            status,
            body,
            cookies,
        })
    }
}

/// Fold `Set-Cookie` headers into the identity's cookie header.
///
/// Returns `None` when the response set no cookies, so the identity keeps
/// what it had.
fn merge_cookies(existing: Option<&str>, headers: &HeaderMap) -> Option<String> {
    let set: Vec<(String, String)> = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|raw| {
            let pair = raw.split(';').next()?.trim();
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
        })
        .collect();
    if set.is_empty() {
        return None;
    }

    let mut jar: BTreeMap<String, String> = existing
        .unwrap_or_default()
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.to_string(), value.to_string()))
        })
        .collect();
    jar.extend(set);

    Some(
        jar.iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; "),
    )
}
