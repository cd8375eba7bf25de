pub mod engine;
pub mod store;
pub mod types;

pub use engine::{AssessDecision, RiskEngine};
pub use store::{PersistHook, RiskStore, StoreMetricsSnapshot};
pub use types::{Delta, Limits, Parameters, RiskState, RiskStateTransition, SetMarker};
