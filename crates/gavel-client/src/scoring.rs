use std::time::Duration;

use gavel_core::error::AppError;
use gavel_core::models::Fields;
use gavel_core::traits::{ShippingEstimator, ValuePredictor};
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_SCORING_TIMEOUT: Duration = Duration::from_secs(20);

/// JSON client for a scoring endpoint that takes listing fields and answers
/// with one number.
#[derive(Clone)]
struct ScoringClient {
    client: Client,
    url: String,
    api_key: Option<String>,
}

// ---- Scoring API types ----

#[derive(Serialize)]
struct ScoreRequest<'a> {
    fields: &'a Fields,
}

#[derive(Deserialize)]
struct PredictionResponse {
    predicted_value: f64,
}

#[derive(Deserialize)]
struct ShippingResponse {
    shipping_cost: f64,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl ScoringClient {
    fn build(url: &str, api_key: Option<&str>, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            url: url.to_string(),
            api_key: api_key.map(str::to_string),
        })
    }

    /// POST the fields and decode the response as `T`.
    ///
    /// Every failure is `AnalysisUnavailable`: the listing is deferred, not
    /// dropped.
    async fn score<T: serde::de::DeserializeOwned>(&self, fields: &Fields) -> Result<T, AppError> {
        let mut request = self.client.post(&self.url).json(&ScoreRequest { fields });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::AnalysisUnavailable(format!("{} timed out", self.url))
            } else if e.is_connect() {
                AppError::AnalysisUnavailable(format!("connection to {} failed: {e}", self.url))
            } else {
                AppError::AnalysisUnavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {status_code}: {body}"));
            return Err(AppError::AnalysisUnavailable(message));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::AnalysisUnavailable(format!("invalid response from {}: {e}", self.url)))
    }
}

/// Market value predictor behind an HTTP endpoint.
///
/// Request: `{"fields": {...}}`. Response: `{"predicted_value": 123.0}`.
#[derive(Clone)]
pub struct HttpValuePredictor {
    inner: ScoringClient,
}

impl HttpValuePredictor {
    pub fn new(url: &str, api_key: Option<&str>) -> Result<Self, AppError> {
        Self::with_timeout(url, api_key, DEFAULT_SCORING_TIMEOUT)
    }

    pub fn with_timeout(url: &str, api_key: Option<&str>, timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            inner: ScoringClient::build(url, api_key, timeout)?,
        })
    }
}

impl ValuePredictor for HttpValuePredictor {
    async fn predict_value(&self, fields: &Fields) -> Result<f64, AppError> {
        let response: PredictionResponse = self.inner.score(fields).await?;
        Ok(response.predicted_value)
    }
}

/// Shipping cost estimator behind an HTTP endpoint.
///
/// Request: `{"fields": {...}}`. Response: `{"shipping_cost": 12.5}`.
#[derive(Clone)]
pub struct HttpShippingEstimator {
    inner: ScoringClient,
}

impl HttpShippingEstimator {
    pub fn new(url: &str, api_key: Option<&str>) -> Result<Self, AppError> {
        Self::with_timeout(url, api_key, DEFAULT_SCORING_TIMEOUT)
    }

    pub fn with_timeout(url: &str, api_key: Option<&str>, timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            inner: ScoringClient::build(url, api_key, timeout)?,
        })
    }
}

impl ShippingEstimator for HttpShippingEstimator {
    async fn estimate_shipping_cost(&self, fields: &Fields) -> Result<f64, AppError> {
        let response: ShippingResponse = self.inner.score(fields).await?;
        Ok(response.shipping_cost)
    }
}
