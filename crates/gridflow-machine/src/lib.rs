// Copyright 2025 DataStax Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Transition validation and event replay.
//!
//! Two pure views over `(instance, template)`:
//!
//! - [`StateMachine`] answers whether a step transition is legal *before* the
//!   engine appends any event,
//! - [`replay`]/[`apply_event`] fold the event log into an instance document
//!   *after* events are committed.
//!
//! Both are deterministic and perform no I/O; replaying the same events
//! always yields the same instance, which is what makes the projections in
//! the state and index stores rebuildable caches rather than state of
//! record.

mod error;
mod machine;
mod replay;

pub use error::{MachineError, Result};
pub use machine::StateMachine;
pub use replay::{apply_event, initial_instance, replay};
