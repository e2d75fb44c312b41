//! Pipeline stages for image rehosting.
//!
//! Each submodule implements one step; the orchestrator in [`crate::rehost`]
//! wires them together and [`crate::stream`] runs the two network stages
//! concurrently.
//!
//! ## Data Flow
//!
//! ```text
//! extract ──▶ fetch ──▶ upload ──▶ mapping ──▶ rewrite
//! (text→URLs) (HTTP GET) (store)   (join)      (substitute + backup)
//! ```
//!
//! 1. [`extract`]: scan document text for image URLs
//! 2. [`fetch`]: download one URL with size and format checks
//! 3. [`upload`]: authenticate once, republish one artifact
//! 4. [`mapping`]: persist stage maps and join them into the final mapping
//! 5. [`rewrite`]: exact, boundary-checked substitution with backup

pub mod extract;
pub mod fetch;
pub mod mapping;
pub mod rewrite;
pub mod upload;
