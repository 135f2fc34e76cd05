//! Per-build Run State.
//!
//! One Run State is shared by every step of a build. It bundles:
//! - the [`ArtifactRepository`](crate::artifact::ArtifactRepository)
//! - a per-plan-id store of typed results
//! - rendezvous points for externally supplied or consumed byte streams

mod rendezvous;
mod run_state;

pub use rendezvous::Rendezvous;
pub use run_state::RunState;
