//! Mirror and lock file reconciliation.
//!
//! One run:
//! 1. read the lock file (a missing file aborts before any mirror work)
//! 2. snapshot the mirror listing
//! 3. derive the referenced entries and the per-spec work list
//! 4. digest or fetch each spec through the limiter, collecting every outcome
//! 5. delete unreferenced entries
//! 6. rewrite the lock file if, and only if, a value changed

use crate::error::{EngineError, FetchError};
use crate::fetch::Fetcher;
use crate::hook::AfterRewrite;
use crate::limiter::Limiter;
use futures::future::join_all;
use lockmirror_core::{
    CredentialResolver, DigestTable, Integrity, Manifest, MirrorConfig, Spec,
};
use lockmirror_storage::{MirrorStore, digest_file};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::instrument;
use uuid::Uuid;

/// Summary of one run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Mirror entries created this run.
    pub added: Vec<PathBuf>,
    /// Unreferenced mirror entries deleted this run.
    pub removed: Vec<PathBuf>,
    /// Specs that could not be mirrored this run.
    pub failed: Vec<Spec>,
    /// Whether the lock file was rewritten.
    pub manifest_written: bool,
}

impl ReconcileReport {
    /// Nothing was added, removed or rewritten.
    pub fn is_up_to_date(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && !self.manifest_written
    }
}

/// One spec to bring into the mirror.
#[derive(Clone, Debug)]
struct MirrorTask {
    spec: Spec,
    url: String,
    path: PathBuf,
}

/// Everything derived from the lock file before any I/O.
#[derive(Debug, Default)]
struct Plan {
    referenced: BTreeSet<PathBuf>,
    tasks: Vec<MirrorTask>,
}

impl Plan {
    /// Every record reserves the entry named after its spec, eligible or
    /// not, and a record already wired to a local file keeps that file alive.
    /// Eligible records are grouped by spec; the first record in document
    /// order supplies the download URL.
    ///
    /// Local file locations are relative to `project_dir`.
    fn from_manifest(manifest: &Manifest, store: &MirrorStore, project_dir: &Path) -> Self {
        let mut plan = Self::default();
        let mut scheduled = HashSet::new();

        for (install_path, record) in manifest.packages() {
            let spec = record.spec(install_path);
            let path = store.entry_path(&spec);
            plan.referenced.insert(path.clone());
            if let Some(local) = record.local_file() {
                plan.referenced.insert(project_dir.join(local));
            }

            if !record.is_mirror_eligible(install_path) {
                continue;
            }
            let Some(url) = record.remote_url() else {
                continue;
            };
            if scheduled.insert(spec.clone()) {
                plan.tasks.push(MirrorTask {
                    spec,
                    url: url.to_string(),
                    path,
                });
            }
        }

        plan
    }
}

/// Drives a reconciliation run.
pub struct Reconciler {
    config: MirrorConfig,
    resolver: CredentialResolver,
    fetcher: Fetcher,
    limiter: Limiter,
    hook: Option<Box<dyn AfterRewrite>>,
}

impl Reconciler {
    pub fn new(config: MirrorConfig, fetcher: Fetcher) -> Self {
        let resolver = config.credential_resolver();
        Self {
            config,
            resolver,
            fetcher,
            limiter: Limiter::new(),
            hook: None,
        }
    }

    /// Admit mirror and delete tasks through `limiter` instead of the
    /// default one.
    pub fn with_limiter(mut self, limiter: Limiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Run `hook` after every successful lock file rewrite.
    pub fn with_hook(mut self, hook: impl AfterRewrite + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Reconcile the mirror directory with `lockfile`.
    ///
    /// A relative mirror path is taken relative to the directory holding
    /// `lockfile`, which is also what the rewritten `file:` locations are
    /// relative to.
    ///
    /// Only lock file and mirror listing failures are returned as errors.
    /// Per-record failures are logged and reported in
    /// [`ReconcileReport::failed`].
    #[instrument(skip(self), fields(mirror = %self.config.mirror_path.display()))]
    pub async fn run(&self, lockfile: &Path) -> Result<ReconcileReport, EngineError> {
        let mut manifest = read_manifest(lockfile).await?;
        let project_dir = project_dir(lockfile);
        let store = MirrorStore::open(project_dir.join(&self.config.mirror_path)).await?;
        let existing = store.list().await?;
        let plan = Plan::from_manifest(&manifest, &store, project_dir);

        tracing::debug!(
            existing = existing.len(),
            referenced = plan.referenced.len(),
            tasks = plan.tasks.len(),
            legacy = manifest.has_legacy_dependencies(),
            limit = self.limiter.bound(),
            "planned mirror run"
        );

        let mut report = ReconcileReport::default();

        let outcomes = join_all(
            plan.tasks
                .iter()
                .map(|task| self.limiter.run(|| self.mirror_one(&store, task))),
        )
        .await;

        let mut digests = DigestTable::new();
        for (task, outcome) in plan.tasks.into_iter().zip(outcomes) {
            match outcome {
                Ok(integrity) => {
                    if !existing.contains(&task.path) {
                        tracing::info!("+ {}", task.path.display());
                        report.added.push(task.path);
                    }
                    digests.insert(task.spec, integrity);
                }
                Err(e) => {
                    tracing::warn!(spec = %task.spec, "{e}");
                    report.failed.push(task.spec);
                }
            }
        }

        let unused: Vec<PathBuf> = existing.difference(&plan.referenced).cloned().collect();
        let deletions = join_all(
            unused
                .iter()
                .map(|path| self.limiter.run(|| store.delete(path))),
        )
        .await;
        for (path, result) in unused.into_iter().zip(deletions) {
            match result {
                Ok(()) => {
                    tracing::info!("- {}", path.display());
                    report.removed.push(path);
                }
                Err(e) => tracing::error!(path = %path.display(), error = %e, "failed to remove mirror entry"),
            }
        }

        if !report.added.is_empty() || !report.removed.is_empty() {
            tracing::info!(
                "mirror (+{}, -{})",
                report.added.len(),
                report.removed.len()
            );
        }

        if manifest.rewrite(&digests, &self.config.mirror_path) {
            write_manifest(lockfile, &manifest).await?;
            report.manifest_written = true;
            tracing::info!("mirror updated {}", lockfile.display());

            if let Some(hook) = &self.hook {
                hook.after_rewrite(lockfile).await;
            }
        }

        if report.is_up_to_date() {
            tracing::info!("mirror is up to date");
        }

        Ok(report)
    }

    /// Digest an existing entry, or fetch it if there is no usable copy.
    async fn mirror_one(&self, store: &MirrorStore, task: &MirrorTask) -> Result<Integrity, FetchError> {
        match digest_file(&task.path).await {
            Ok(Some(integrity)) => {
                tracing::debug!(spec = %task.spec, "reusing mirror entry");
                return Ok(integrity);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(spec = %task.spec, "{e}"),
        }

        let credentials = self.resolver.resolve(&task.url);
        self.fetcher
            .fetch_into(&task.url, &credentials, store, &task.path)
            .await
    }
}

/// Directory holding `lockfile`, empty for a bare file name.
fn project_dir(lockfile: &Path) -> &Path {
    lockfile.parent().unwrap_or(Path::new(""))
}

async fn read_manifest(path: &Path) -> Result<Manifest, EngineError> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EngineError::ManifestMissing(path.to_path_buf()));
        }
        Err(source) => {
            return Err(EngineError::ManifestRead {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    Manifest::parse(&text).map_err(|source| EngineError::ManifestParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Replace the lock file in one step: write a sibling temporary file, then
/// rename it over the original.
async fn write_manifest(path: &Path, manifest: &Manifest) -> Result<(), EngineError> {
    let text = manifest
        .to_json_pretty()
        .map_err(EngineError::ManifestSerialize)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!("{file_name}.tmp.{}", Uuid::new_v4()));

    let result = async {
        fs::write(&temp_path, text).await?;
        fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(source) = result {
        let _ = fs::remove_file(&temp_path).await;
        return Err(EngineError::ManifestWrite {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}
