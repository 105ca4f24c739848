pub mod engine;
pub mod milestones;
pub mod transitions;

pub use engine::{ChargeHandle, ConfirmOutcome, DisputeDisposition, EscrowEngine};
pub use milestones::{MilestoneFlow, NewMilestone};
