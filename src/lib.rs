//! Session Forecast Library
//!
//! This module exposes the forecasting engine and its data-store
//! collaborators for testing and potential reuse.

pub mod aggregate;
pub mod api;
pub mod calendar;
pub mod config;
pub mod csv_store;
pub mod db;
pub mod error;
pub mod forecast;
pub mod holds;
pub mod ml;
pub mod models;
pub mod pipeline;
pub mod risk;
pub mod traits;

// Re-export commonly used types
pub use aggregate::{Aggregation, AggregationDiagnostics, RejectReason, aggregate};
pub use api::RestStore;
pub use calendar::WorkCalendar;
pub use config::{AppConfig, ForecastConfig, StoreBackend};
pub use csv_store::CsvStore;
pub use db::PostgresStore;
pub use error::ForecastError;
pub use forecast::Forecaster;
pub use holds::{HoldsSummary, MemberSlotAffinity};
pub use ml::{EvaluationMetrics, TrainedModel, TrainingError};
pub use models::{
    AttendanceEvent, CalendarDay, CapacityRule, ForecastRow, MemberHold, RiskFlag, SessionSlot,
    SlotKey,
};
pub use pipeline::{PipelineInputs, PipelineOutput, run, run_with_store};
pub use risk::{CapacityMatcher, RiskClassifier};
pub use traits::{Clock, ForecastStore, MockClock, MockStore, SystemClock};
