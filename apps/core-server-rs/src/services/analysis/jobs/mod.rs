mod cooccurrence_v1;
mod correlation_matrix_v1;
mod alarm_rule_backtest_v1;
mod embeddings_build_v1;
mod event_match_v1;
pub(crate) mod event_utils;
mod forecast_materialize_v1;
mod lake_backfill_v1;
mod lake_inspect_v1;
mod lake_parity_check_v1;
mod lake_replication_tick_v1;
mod matrix_profile_v1;
mod related_sensors_unified_v2;
mod related_sensors_v1;
mod runner;
mod store;
mod types;

pub mod eval;

pub use runner::AnalysisJobService;
pub use types::*;
