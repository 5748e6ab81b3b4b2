//! Rule repository seam and the filesystem-backed implementation.
//!
//! The version-controlled rule repository is external; the engine sees
//! it as "get revision marker" + "list templates". The filesystem
//! implementation scans a checkout directory of YAML template files and
//! derives a monotonically increasing revision from a content digest.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use faultline_core::model::RuleTemplate;

use crate::error::RulesError;
use crate::schema::TemplateDoc;

/// One template file that failed to load; surfaced as a conflict by
/// the reconciler rather than aborting the whole listing.
#[derive(Debug, Clone)]
pub struct LoadFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Result of listing the repository head.
#[derive(Debug, Clone, Default)]
pub struct TemplateListing {
    pub templates: Vec<RuleTemplate>,
    pub failures: Vec<LoadFailure>,
}

/// Version-controlled source of rule templates.
#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Current revision marker. Monotonically increasing.
    async fn head_revision(&self) -> Result<u64, RulesError>;

    /// All templates at head, plus per-file load failures.
    async fn list_templates(&self) -> Result<TemplateListing, RulesError>;
}

#[derive(Default)]
struct RevisionState {
    counter: u64,
    digest: Option<[u8; 32]>,
}

/// Scans a directory (recursively) for `*.yml` / `*.yaml` template
/// files. Dotfiles and non-YAML files are skipped; parse errors are
/// reported per file and do not abort the scan.
///
/// The revision marker is a counter bumped whenever the sha256 digest
/// over the sorted (path, contents) set changes, so repeated listings
/// of an unchanged checkout observe the same revision.
pub struct FsRuleRepository {
    dir: PathBuf,
    state: Mutex<RevisionState>,
}

impl FsRuleRepository {
    /// Create a repository over the given checkout directory,
    /// creating it (and parents) if missing.
    pub fn new(dir: PathBuf) -> Self {
        if !dir.exists() {
            if let Err(e) = fs::create_dir_all(&dir) {
                warn!(path = %dir.display(), error = %e, "failed to create rules directory");
            }
        }
        Self {
            dir,
            state: Mutex::new(RevisionState::default()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn is_yaml(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yml" || e == "yaml")
            .unwrap_or(false)
    }

    /// Collect (relative path, contents) for every YAML file, sorted
    /// by path for a stable digest.
    fn collect_files(&self) -> Result<Vec<(PathBuf, String)>, RulesError> {
        let mut files = Vec::new();
        self.scan_dir(&self.dir, &mut files)?;
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }

    fn scan_dir(&self, dir: &Path, out: &mut Vec<(PathBuf, String)>) -> Result<(), RulesError> {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "failed to read directory");
                return Ok(());
            }
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();

            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with('.') {
                    continue;
                }
            }

            if path.is_dir() {
                self.scan_dir(&path, out)?;
                continue;
            }

            if !Self::is_yaml(&path) {
                continue;
            }

            match fs::read_to_string(&path) {
                Ok(contents) => {
                    let rel = path.strip_prefix(&self.dir).unwrap_or(&path).to_path_buf();
                    out.push((rel, contents));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read rule file");
                }
            }
        }

        Ok(())
    }

    fn digest(files: &[(PathBuf, String)]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for (path, contents) in files {
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(contents.as_bytes());
            hasher.update([0u8]);
        }
        hasher.finalize().into()
    }

    fn current_revision(&self, files: &[(PathBuf, String)]) -> u64 {
        let digest = Self::digest(files);
        let mut state = self.state.lock().expect("revision state lock poisoned");
        if state.digest != Some(digest) {
            state.counter += 1;
            state.digest = Some(digest);
            info!(revision = state.counter, files = files.len(), "rule repository changed");
        }
        state.counter
    }
}

#[async_trait]
impl RuleRepository for FsRuleRepository {
    async fn head_revision(&self) -> Result<u64, RulesError> {
        let files = self.collect_files()?;
        Ok(self.current_revision(&files))
    }

    async fn list_templates(&self) -> Result<TemplateListing, RulesError> {
        let files = self.collect_files()?;
        self.current_revision(&files);

        let mut listing = TemplateListing::default();
        for (path, contents) in files {
            match TemplateDoc::from_yaml(&contents).and_then(TemplateDoc::into_template) {
                Ok(template) => listing.templates.push(template),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse rule template");
                    listing.failures.push(LoadFailure {
                        path,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(listing)
    }
}
