pub mod scheduler;
pub mod sweeps;

pub use scheduler::SweepScheduler;
pub use sweeps::{SettlementSweeps, SweepReport};
