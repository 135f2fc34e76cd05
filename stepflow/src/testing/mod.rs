//! Testing utilities for stepflow plans.
//!
//! This module provides:
//! - Scripted fake steps and step factories with call counters
//! - In-memory artifact sources and recording destinations
//! - Fake workers, containers and processes
//! - A fake resource fetcher

mod artifacts;
mod resource;
mod steps;
mod worker;

pub use artifacts::{InMemorySource, RecordingDestination};
pub use resource::{FakeResourceFetcher, FakeVersionedSource};
pub use steps::{FakeStep, FakeStepFactory, Journal, Script, StepCounters};
pub use worker::{
    FakeContainer, FakeProcess, FakeVolume, FakeWorker, FakeWorkerClient, ProcessScript,
};
