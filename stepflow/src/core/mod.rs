//! Core domain model types for stepflow.
//!
//! This module contains the small value types shared by every step:
//! - Plan identifiers
//! - Typed step results (versions, exit statuses)
//! - The final build status

mod plan_id;
mod result;
mod status;

pub use plan_id::PlanId;
pub use result::{ExitStatus, MetadataField, Version, VersionInfo};
pub use status::BuildStatus;
