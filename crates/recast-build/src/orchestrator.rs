//! The recipe build pipeline.
//!
//! `Idle -> ParentResolved -> WorkspaceReady -> SnapshotReady ->
//! prepare -> build -> teardown -> Committed -> Done`. Any phase may fail;
//! the workspace and the build snapshot are released on every exit path
//! once acquired, and release failures are only logged.

use std::fmt;
use std::path::PathBuf;

use recast_common::constants::{DEFAULT_TAG, DEFAULT_WORKSPACE_BASE, RECIPES_MOUNT_PATH};
use recast_common::error::{RecastError, Result};
use recast_common::types::{ContainerId, Digest, SnapshotKey, Stage};
use recast_image::Store;
use recast_image::config::ImageConfigDocument;
use recast_image::manifest::Descriptor;
use recast_image::reference::ImageRef;
use recast_runtime::cancel::CancelToken;
use recast_runtime::stage::{MountSpec, StageRunner, StageSpec, merge_env};
use recast_runtime::workspace::Workspace;

use crate::cleanup::CleanupStack;
use crate::commit::{ParentImage, commit_snapshot};
use crate::recipe::Recipe;

/// Progress of a single build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    /// Nothing done yet.
    Idle,
    /// Target and parent references computed and the parent loaded.
    ParentResolved,
    /// Scratch workspace and mount set allocated.
    WorkspaceReady,
    /// Writable build snapshot prepared.
    SnapshotReady,
    /// The given stage exited successfully.
    StageDone(Stage),
    /// The new image is registered and unpacked.
    Committed,
    /// Resources released; the build succeeded.
    Done,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::ParentResolved => f.write_str("parent-resolved"),
            Self::WorkspaceReady => f.write_str("workspace-ready"),
            Self::SnapshotReady => f.write_str("snapshot-ready"),
            Self::StageDone(stage) => write!(f, "{}-done", stage.as_str()),
            Self::Committed => f.write_str("committed"),
            Self::Done => f.write_str("done"),
        }
    }
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// Reference the new image is registered under.
    pub reference: ImageRef,
    /// Descriptor of the new manifest.
    pub manifest: Descriptor,
    /// Descriptor of the layer the build added.
    pub layer: Descriptor,
    /// Uncompressed digest of that layer.
    pub diff_id: Digest,
}

/// Builds images from recipes against one store.
#[derive(Debug)]
pub struct Builder<R> {
    store: Store,
    runner: R,
    workspace_base: PathBuf,
}

impl<R: StageRunner> Builder<R> {
    /// Creates a builder that runs stages with `runner`.
    pub fn new(store: Store, runner: R) -> Self {
        Self {
            store,
            runner,
            workspace_base: PathBuf::from(DEFAULT_WORKSPACE_BASE),
        }
    }

    /// Allocates scratch workspaces under `base` instead of the default.
    #[must_use]
    pub fn with_workspace_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.workspace_base = base.into();
        self
    }

    /// The store images are built into.
    pub const fn store(&self) -> &Store {
        &self.store
    }

    /// The stage runner.
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Builds `recipe` as `<prefix><name>:<tag>`.
    ///
    /// An empty `tag` means `latest`. `env` is added to every stage after
    /// the parent image's and the recipe's environment.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered: `ReferenceResolution`,
    /// `UnresolvedParent`, `ParentImageFetch`, `Snapshot`,
    /// `StageExecution`, `Cancelled`, or any commit failure.
    pub fn build_recipe(
        &self,
        recipe: &Recipe,
        tag: &str,
        prefix: &str,
        env: &[String],
        cancel: &CancelToken,
    ) -> Result<BuildOutcome> {
        let mut phase = BuildPhase::Idle;
        let mut cleanup = CleanupStack::new();
        let result = self.run_phases(recipe, tag, prefix, env, cancel, &mut phase, &mut cleanup);
        let failed_cleanups = cleanup.run();

        match result {
            Ok(outcome) => {
                phase = BuildPhase::Done;
                tracing::info!(
                    recipe = %recipe.name,
                    image = %outcome.reference,
                    manifest = %outcome.manifest.digest,
                    %phase,
                    failed_cleanups,
                    "build finished"
                );
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(recipe = %recipe.name, %phase, error = %e, failed_cleanups, "build failed");
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_phases<'a>(
        &'a self,
        recipe: &Recipe,
        tag: &str,
        prefix: &str,
        env: &[String],
        cancel: &CancelToken,
        phase: &mut BuildPhase,
        cleanup: &mut CleanupStack<'a>,
    ) -> Result<BuildOutcome> {
        let tag = if tag.is_empty() { DEFAULT_TAG } else { tag };
        let target = ImageRef::parse(&format!("{prefix}{}:{tag}", recipe.name))?;
        let inherits = if recipe.inherits_external {
            recipe.inherits.clone()
        } else {
            format!("{prefix}{}", recipe.inherits)
        };
        // An untagged parent follows the tag being built.
        let parent_ref = ImageRef::parse_with_default_tag(&inherits, &target.tag)?;
        tracing::info!(recipe = %recipe.name, image = %target, parent = %parent_ref, "building recipe");

        cancel.check()?;
        let (parent, parent_chain) = self.load_parent(&parent_ref)?;
        advance(phase, BuildPhase::ParentResolved);

        cancel.check()?;
        let workspace = Workspace::create(&self.workspace_base)?;
        let mut mounts = workspace.scratch_mounts();
        mounts.push(MountSpec::readonly(&recipe.recipes_dir, RECIPES_MOUNT_PATH));
        cleanup.push("destroy workspace", move || workspace.destroy());
        advance(phase, BuildPhase::WorkspaceReady);

        cancel.check()?;
        let key = SnapshotKey::generate();
        let parent_snapshot = parent_chain.to_string();
        let rootfs = self
            .store
            .snapshots()
            .prepare(key.as_str(), Some(parent_snapshot.as_str()))?;
        let snapshots = self.store.snapshots();
        let remove_key = key.clone();
        cleanup.push("remove build snapshot", move || snapshots.remove(remove_key.as_str()));
        advance(phase, BuildPhase::SnapshotReady);

        let stage_env = merge_env([
            parent.config.env().as_slice(),
            recipe.env_entries().as_slice(),
            env,
        ]);
        for stage in Stage::ALL {
            cancel.check()?;
            let args = if stage == Stage::Build {
                vec![recipe.name.clone()]
            } else {
                Vec::new()
            };
            let spec = StageSpec {
                id: ContainerId::generate(),
                stage,
                rootfs: rootfs.clone(),
                mounts: mounts.clone(),
                entry_point: stage.entry_point().to_owned(),
                args,
                env: stage_env.clone(),
                host_network: true,
            };
            let code = self.runner.run(&spec, cancel)?;
            if code != 0 {
                return Err(RecastError::StageExecution {
                    stage,
                    exit_code: Some(code),
                    message: format!("{} exited with a non-zero status", spec.entry_point),
                });
            }
            advance(phase, BuildPhase::StageDone(stage));
        }

        cancel.check()?;
        let committed = commit_snapshot(&self.store, &parent, key.as_str(), &target)?;
        advance(phase, BuildPhase::Committed);

        Ok(BuildOutcome {
            reference: target,
            manifest: committed.manifest,
            layer: committed.layer.descriptor,
            diff_id: committed.layer.diff_id,
        })
    }

    /// Loads the parent image and makes sure its snapshot chain exists.
    fn load_parent(&self, reference: &ImageRef) -> Result<(ParentImage, Digest)> {
        let name = reference.full_name();
        let fetch_error = |e: RecastError| RecastError::ParentImageFetch {
            reference: name.clone(),
            source: Box::new(e),
        };
        let record = self
            .store
            .images()
            .find(&name)
            .map_err(fetch_error)?
            .ok_or_else(|| RecastError::UnresolvedParent {
                reference: name.clone(),
            })?;
        let manifest = self.store.read_manifest(&record.target).map_err(fetch_error)?;
        let config_bytes = self
            .store
            .content()
            .read_blob(&manifest.config.digest)
            .map_err(fetch_error)?;
        let config = ImageConfigDocument::from_slice(&config_bytes).map_err(fetch_error)?;
        let chain = self.store.image_chain_id(&manifest).map_err(fetch_error)?;
        if !self.store.snapshots().exists(&chain.to_string()) {
            tracing::info!(image = %name, chain = %chain, "unpacking parent image");
            let _ = self.store.unpack(&name).map_err(fetch_error)?;
        }
        tracing::debug!(image = %name, manifest = %record.target.digest, chain = %chain, "parent resolved");
        Ok((
            ParentImage {
                record,
                manifest,
                config,
            },
            chain,
        ))
    }
}

fn advance(phase: &mut BuildPhase, next: BuildPhase) {
    tracing::debug!(from = %phase, to = %next, "build phase");
    *phase = next;
}
