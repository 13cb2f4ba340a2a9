//! Simulated MAGI agent execution.
//!
//! Three sage personas each cast an APPROVED/REJECTED vote with a written
//! rationale, and SOLOMON tallies the votes into a final verdict. No real
//! inference happens here: every response is derived deterministically from
//! a hash of the question, so the same question always yields the same
//! decision.

pub mod judge;
pub mod persona;
pub mod pipeline;

pub use judge::judge;
pub use persona::evaluate;
pub use pipeline::run_decision;
