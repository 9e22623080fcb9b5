//! # recast-build
//!
//! Builds images from recipes.
//!
//! A [`recipe::Recipe`] names a parent image, a source directory, and an
//! environment. The [`orchestrator::Builder`] resolves the parent, runs the
//! prepare, build, and teardown stages against a fresh snapshot of it, and
//! hands the result to [`commit::commit_snapshot`], which records the
//! filesystem delta as a new layer on top of the parent's manifest.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cleanup;
pub mod commit;
pub mod graph;
pub mod orchestrator;
pub mod recipe;

pub use orchestrator::{BuildOutcome, BuildPhase, Builder};
pub use recipe::{Recipe, RecipeSet};
