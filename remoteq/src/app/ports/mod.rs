// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod batch;
pub mod clock;
pub mod job_store;
pub mod remote_exec;

pub use batch::{BatchAdapter, BatchAdapters, RawState, StatusReport};
pub use clock::ClockPort;
pub use job_store::{JobStorePort, NoopJobStore};
pub use remote_exec::{ExecCapture, RemoteExecPort};
