//! Machine learning module for session attendance prediction
//!
//! Attendance is modelled with ridge regression over calendar and
//! per-slot history features, trained on a time-ordered split of past
//! occurrences.

pub mod features;
pub mod model;
pub mod training;

pub use features::{FeatureRow, FeatureSpec, PredictionFeatures, SlotHistory, build_features, slot_histories};
pub use model::{RidgeFit, RidgeRegression, TrainedModel, TrainingError};
pub use training::{EvaluationMetrics, train_and_evaluate};
