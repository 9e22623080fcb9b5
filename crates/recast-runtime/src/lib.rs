//! # recast-runtime
//!
//! Runs build stages as ephemeral containers.
//!
//! A stage is described by a [`stage::StageSpec`] and executed by a
//! [`stage::StageRunner`]. The [`chroot::ChrootRunner`] is the native
//! Linux implementation; tests supply scripted runners through the same
//! trait. Scratch directories come from [`workspace::Workspace`] and
//! in-flight stages observe a shared [`cancel::CancelToken`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cancel;
pub mod chroot;
pub mod stage;
pub mod workspace;
