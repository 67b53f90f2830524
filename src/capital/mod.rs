pub mod manager;
pub mod sizer;

pub use manager::{Allocation, AllocationOutcome, CapitalManager};
pub use sizer::{fit_levels, size_order, SizerError};
