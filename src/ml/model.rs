//! Ridge regression and the fitted model used for forecasting

use chrono::NaiveDate;
use linfa::{Dataset, traits::Fit};
use linfa_linear::LinearRegression;
use ndarray::{Array1, Array2, Axis, s};
use thiserror::Error;

use super::training::EvaluationMetrics;

/// Errors that can occur during model training
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrainingError {
    #[error("Insufficient training data: {samples} samples for {features} features")]
    InsufficientData { samples: usize, features: usize },
    #[error("Feature and target lengths mismatch: {features} vs {targets}")]
    MismatchedLengths { features: usize, targets: usize },
    #[error("Invalid ridge penalty: {0}")]
    InvalidPenalty(f64),
    #[error("Array error: {0}")]
    ArrayError(String),
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),
}

/// L2-regularised least squares with an unpenalised intercept.
///
/// Minimises `||y - Xw - b||^2 + penalty * ||w||^2`. Features and targets are
/// centred so the intercept drops out of the penalised system, which is then
/// fitted as an intercept-free least-squares problem.
#[derive(Debug, Clone, Copy)]
pub struct RidgeRegression {
    penalty: f64,
}

impl Default for RidgeRegression {
    fn default() -> Self {
        Self { penalty: 1.0 }
    }
}

/// Weights and intercept of a ridge fit.
#[derive(Debug, Clone, PartialEq)]
pub struct RidgeFit {
    pub weights: Array1<f64>,
    pub bias: f64,
}

impl RidgeFit {
    pub fn predict_row(&self, features: &[f64]) -> f64 {
        self.bias
            + self
                .weights
                .iter()
                .zip(features)
                .map(|(w, x)| w * x)
                .sum::<f64>()
    }
}

impl RidgeRegression {
    pub fn new(penalty: f64) -> Self {
        Self { penalty }
    }

    pub fn penalty(&self) -> f64 {
        self.penalty
    }

    pub fn fit(&self, x: &Array2<f64>, y: &Array1<f64>) -> Result<RidgeFit, TrainingError> {
        if !self.penalty.is_finite() || self.penalty < 0.0 {
            return Err(TrainingError::InvalidPenalty(self.penalty));
        }

        let (n_samples, n_features) = x.dim();
        if n_samples != y.len() {
            return Err(TrainingError::MismatchedLengths {
                features: n_samples,
                targets: y.len(),
            });
        }
        if n_samples == 0 || n_samples < n_features {
            return Err(TrainingError::InsufficientData {
                samples: n_samples,
                features: n_features,
            });
        }

        let x_mean = x
            .mean_axis(Axis(0))
            .ok_or_else(|| TrainingError::ArrayError("empty design matrix".to_string()))?;
        let y_mean = y.sum() / n_samples as f64;

        let x_centred = x - &x_mean;
        let y_centred = y - y_mean;

        // Ridge as least squares over rows stacked with sqrt(penalty) * I and zero targets.
        let mut records = Array2::<f64>::zeros((n_samples + n_features, n_features));
        records.slice_mut(s![..n_samples, ..]).assign(&x_centred);
        let root = self.penalty.sqrt();
        for j in 0..n_features {
            records[[n_samples + j, j]] = root;
        }
        let mut targets = Array1::<f64>::zeros(n_samples + n_features);
        targets.slice_mut(s![..n_samples]).assign(&y_centred);

        let dataset = Dataset::new(records, targets);
        let fitted = LinearRegression::new()
            .with_intercept(false)
            .fit(&dataset)
            .map_err(|e: linfa_linear::LinearError<f64>| {
                TrainingError::NumericalInstability(e.to_string())
            })?;

        let weights = fitted.params().to_owned();
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(TrainingError::NumericalInstability(
                "solution contains non-finite weights".to_string(),
            ));
        }

        let bias = y_mean - x_mean.dot(&weights);
        if !bias.is_finite() {
            return Err(TrainingError::NumericalInstability(
                "intercept is not finite".to_string(),
            ));
        }

        Ok(RidgeFit { weights, bias })
    }
}

/// A trained attendance model. Lives for one pipeline run.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    fit: RidgeFit,
    /// Feature names in the order the weights expect them.
    pub feature_names: Vec<String>,
    pub ridge_penalty: f64,
    /// First and last session date of the training rows.
    pub training_window: (NaiveDate, NaiveDate),
    /// First and last session date of the evaluation rows, if any.
    pub evaluation_window: Option<(NaiveDate, NaiveDate)>,
    pub training_samples: usize,
    pub metrics: Option<EvaluationMetrics>,
}

impl TrainedModel {
    pub fn new(
        fit: RidgeFit,
        feature_names: Vec<String>,
        ridge_penalty: f64,
        training_window: (NaiveDate, NaiveDate),
        training_samples: usize,
    ) -> Self {
        Self {
            fit,
            feature_names,
            ridge_penalty,
            training_window,
            evaluation_window: None,
            training_samples,
            metrics: None,
        }
    }

    /// Raw model output for one feature vector; may be negative.
    pub fn predict(&self, features: &[f64]) -> f64 {
        self.fit.predict_row(features)
    }

    /// Get the model coefficients
    pub fn weights(&self) -> &Array1<f64> {
        &self.fit.weights
    }

    pub fn bias(&self) -> f64 {
        self.fit.bias
    }

    /// Get model information as a string
    pub fn info(&self) -> String {
        format!(
            "TrainedModel(samples={}, penalty={}, window={}..{}, mae={}, rmse={})",
            self.training_samples,
            self.ridge_penalty,
            self.training_window.0,
            self.training_window.1,
            self.metrics
                .as_ref()
                .map(|m| format!("{:.2}", m.mae))
                .unwrap_or_else(|| "N/A".to_string()),
            self.metrics
                .as_ref()
                .map(|m| format!("{:.2}", m.rmse))
                .unwrap_or_else(|| "N/A".to_string()),
        )
    }

    /// (name, weight) pairs for logging.
    pub fn coefficients(&self) -> Vec<(&str, f64)> {
        self.feature_names
            .iter()
            .map(String::as_str)
            .zip(self.fit.weights.iter().copied())
            .collect()
    }
}
