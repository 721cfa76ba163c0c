/*
 * TDAQ Run Operator - Kubernetes lifecycle controller for TDAQ runs
 * Copyright (C) 2025 TDAQ team
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Run operator core library
//!
//! This crate keeps worker Deployments in step with declared `RunResource`s:
//! one Deployment per run identity, label-based discovery of what is already
//! deployed, and garbage collection of finished Deployments and the namespaces
//! they leave empty.

pub mod crds;
pub mod health;
pub mod tasks;

// Re-export commonly used types
pub use crds::{RunResource, RunResourceSpec, RunResourceStatus};
pub use tasks::config::ControllerConfig;
pub use tasks::types::{Error, Result};
