use gavel_client::{HttpShippingEstimator, HttpValuePredictor};
use gavel_core::config::PipelineConfig;
use gavel_core::models::Fields;
use gavel_core::{AppError, FlatRateShipping, ShippingEstimator, ValuePredictor};

/// Value predictor chosen from `[scoring]`.
///
/// Without a `predictor_url` every prediction is unavailable, so `run`
/// refuses to start unconfigured.
#[derive(Clone)]
pub enum Predictor {
    Http(HttpValuePredictor),
    Unconfigured,
}

impl Predictor {
    pub fn from_config(config: &PipelineConfig) -> Result<Self, AppError> {
        match &config.scoring.predictor_url {
            Some(url) => Ok(Self::Http(HttpValuePredictor::with_timeout(
                url,
                config.scoring.api_key.as_deref(),
                config.fetch_timeout(),
            )?)),
            None => Ok(Self::Unconfigured),
        }
    }

    pub fn is_configured(&self) -> bool {
        matches!(self, Self::Http(_))
    }
}

impl ValuePredictor for Predictor {
    async fn predict_value(&self, fields: &Fields) -> Result<f64, AppError> {
        match self {
            Self::Http(predictor) => predictor.predict_value(fields).await,
            Self::Unconfigured => Err(AppError::AnalysisUnavailable(
                "no [scoring].predictor_url configured".to_string(),
            )),
        }
    }
}

/// Shipping estimator chosen from `[scoring]`: the HTTP service when a
/// `shipping_url` is set, the flat-rate strategy otherwise.
#[derive(Clone)]
pub enum Shipping {
    Http(HttpShippingEstimator),
    Flat(FlatRateShipping),
}

impl Shipping {
    pub fn from_config(config: &PipelineConfig) -> Result<Self, AppError> {
        match &config.scoring.shipping_url {
            Some(url) => Ok(Self::Http(HttpShippingEstimator::with_timeout(
                url,
                config.scoring.api_key.as_deref(),
                config.fetch_timeout(),
            )?)),
            None => Ok(Self::Flat(FlatRateShipping::new(
                config.analysis.flat_shipping_cost,
            ))),
        }
    }
}

impl ShippingEstimator for Shipping {
    async fn estimate_shipping_cost(&self, fields: &Fields) -> Result<f64, AppError> {
        match self {
            Self::Http(estimator) => estimator.estimate_shipping_cost(fields).await,
            Self::Flat(flat) => flat.estimate_shipping_cost(fields).await,
        }
    }
}
