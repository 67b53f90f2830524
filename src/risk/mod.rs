pub mod metrics;
pub mod monitor;

pub use metrics::RiskMetrics;
pub use monitor::{PositionView, RiskInputs, RiskMonitor};
