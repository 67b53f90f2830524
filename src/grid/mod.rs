pub mod engine;
pub mod ladder;
pub mod persistence;

pub use engine::{GridEngine, GridState, TuneAction};
pub use ladder::{build_ladder, GridLevel, Ladder, LadderError, LadderParams};
pub use persistence::GridSnapshot;
