//! Time-ordered training and evaluation

use chrono::{Duration, NaiveDate};
use ndarray::{Array1, Array2};
use tracing::{debug, info};

use crate::config::ForecastConfig;

use super::features::{FeatureRow, FeatureSpec};
use super::model::{RidgeRegression, TrainedModel, TrainingError};

/// Hold-out accuracy of a trained model.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationMetrics {
    pub mae: f64,
    pub rmse: f64,
    pub mean_actual: f64,
    pub mean_predicted: f64,
    /// MAE relative to the mean actual attendance; absent when that mean is 0.
    pub mae_percentage: Option<f64>,
    pub samples: usize,
}

/// Training and evaluation rows, split on a date boundary.
#[derive(Debug)]
pub struct TimeSplit<'a> {
    pub training: Vec<&'a FeatureRow>,
    pub evaluation: Vec<&'a FeatureRow>,
    /// First date of the evaluation window.
    pub cutoff: NaiveDate,
}

/// Split rows so evaluation covers the last `evaluation_window_days` days up to
/// and including the latest date, and training covers everything before.
///
/// A non-positive window leaves the evaluation set empty. Returns `None` for
/// empty input.
pub fn time_ordered_split(rows: &[FeatureRow], evaluation_window_days: i64) -> Option<TimeSplit<'_>> {
    let latest = rows.iter().map(FeatureRow::session_date).max()?;
    let cutoff = if evaluation_window_days >= 1 {
        // A window reaching past the earliest representable date covers everything.
        Duration::try_days(evaluation_window_days - 1)
            .and_then(|span| latest.checked_sub_signed(span))
            .unwrap_or(NaiveDate::MIN)
    } else {
        latest.succ_opt().unwrap_or(NaiveDate::MAX)
    };

    let (evaluation, training): (Vec<_>, Vec<_>) =
        rows.iter().partition(|row| row.session_date() >= cutoff);

    Some(TimeSplit {
        training,
        evaluation,
        cutoff,
    })
}

/// Stack feature vectors and targets into arrays for the solver.
pub fn design_matrix(
    rows: &[&FeatureRow],
    spec: &FeatureSpec,
) -> Result<(Array2<f64>, Array1<f64>), TrainingError> {
    let n_features = spec.num_features();
    let mut flat = Vec::with_capacity(rows.len() * n_features);
    let mut targets = Vec::with_capacity(rows.len());

    for row in rows {
        flat.extend(row.features.to_vec(spec));
        targets.push(row.target());
    }

    let x = Array2::from_shape_vec((rows.len(), n_features), flat)
        .map_err(|e| TrainingError::ArrayError(e.to_string()))?;
    Ok((x, Array1::from_vec(targets)))
}

/// Score a model on held-out rows. Predictions are clamped at zero before scoring.
pub fn evaluate(
    model: &TrainedModel,
    rows: &[&FeatureRow],
    spec: &FeatureSpec,
) -> Option<EvaluationMetrics> {
    if rows.is_empty() {
        return None;
    }

    let n = rows.len() as f64;
    let mut abs_sum = 0.0;
    let mut sq_sum = 0.0;
    let mut actual_sum = 0.0;
    let mut predicted_sum = 0.0;

    for row in rows {
        let predicted = model.predict(&row.features.to_vec(spec)).max(0.0);
        let actual = row.target();
        let error = predicted - actual;
        abs_sum += error.abs();
        sq_sum += error * error;
        actual_sum += actual;
        predicted_sum += predicted;
    }

    let mae = abs_sum / n;
    let mean_actual = actual_sum / n;
    Some(EvaluationMetrics {
        mae,
        rmse: (sq_sum / n).sqrt(),
        mean_actual,
        mean_predicted: predicted_sum / n,
        mae_percentage: (mean_actual > 0.0).then(|| mae / mean_actual * 100.0),
        samples: rows.len(),
    })
}

fn date_span(rows: &[&FeatureRow]) -> Option<(NaiveDate, NaiveDate)> {
    let first = rows.iter().map(|r| r.session_date()).min()?;
    let last = rows.iter().map(|r| r.session_date()).max()?;
    Some((first, last))
}

/// Fit the ridge model on the training split and score it on the evaluation split.
///
/// The returned model is the one fitted on training rows only.
pub fn train_and_evaluate(
    rows: &[FeatureRow],
    spec: &FeatureSpec,
    config: &ForecastConfig,
) -> Result<TrainedModel, TrainingError> {
    let n_features = spec.num_features();
    let Some(split) = time_ordered_split(rows, config.evaluation_window_days) else {
        return Err(TrainingError::InsufficientData {
            samples: 0,
            features: n_features,
        });
    };

    let training_window = match date_span(&split.training) {
        Some(window) if split.training.len() >= n_features => window,
        _ => {
            return Err(TrainingError::InsufficientData {
                samples: split.training.len(),
                features: n_features,
            });
        }
    };

    info!(
        "Training on {} rows ({} to {}), evaluating on {} rows from {}",
        split.training.len(),
        training_window.0,
        training_window.1,
        split.evaluation.len(),
        split.cutoff
    );

    let (x, y) = design_matrix(&split.training, spec)?;
    let fit = RidgeRegression::new(config.ridge_penalty).fit(&x, &y)?;

    let mut model = TrainedModel::new(
        fit,
        spec.feature_names(),
        config.ridge_penalty,
        training_window,
        split.training.len(),
    );

    for (name, weight) in model.coefficients() {
        debug!("  {:<16} {:>10.4}", name, weight);
    }
    debug!("  {:<16} {:>10.4}", "intercept", model.bias());

    model.evaluation_window = date_span(&split.evaluation);
    model.metrics = evaluate(&model, &split.evaluation, spec);

    match &model.metrics {
        Some(m) => info!(
            "Evaluation over {} rows: MAE={:.2} RMSE={:.2} mean actual={:.2} mean predicted={:.2}{}",
            m.samples,
            m.mae,
            m.rmse,
            m.mean_actual,
            m.mean_predicted,
            m.mae_percentage
                .map(|p| format!(" ({:.1}% of mean)", p))
                .unwrap_or_default()
        ),
        None => info!("No evaluation rows; metrics unavailable"),
    }

    Ok(model)
}
