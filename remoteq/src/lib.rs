// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Submit and track batch jobs on a remote SLURM or PBS cluster over SSH.
//!
//! [`app::JobEngine`] is the entry point: build it from an
//! [`adapters::ssh::SshConnector`], the scheduler adapters and a job store,
//! then submit, watch and cancel [`app::types::Job`]s.

pub mod adapters;
pub mod app;
pub mod config;
pub mod logging;
