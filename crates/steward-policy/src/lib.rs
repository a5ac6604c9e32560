//! Tool-call budget governance.
//!
//! The budget caps tool *usage*, not the agent's ability to answer: the Nth
//! call and its consequences (including the final synthesis turn) run to
//! completion, and only the (N+1)th start ends the execution.

mod budget;
mod governor;

pub use budget::{Admission, InvocationBudget, SessionBudget};
pub use governor::{GovernedStream, govern};
