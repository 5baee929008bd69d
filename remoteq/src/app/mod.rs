// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod engine;
pub mod errors;
pub mod metrics;
pub mod polling;
pub mod ports;
pub mod registry;
pub mod services;
pub mod settings;
pub mod submission;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{EnginePorts, JobEngine, RestoreSummary, SubmitFailure};
pub use polling::CycleReport;
pub use settings::{DisappearancePolicy, EngineSettings};
