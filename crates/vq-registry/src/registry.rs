//! The configuration registry: loads Analysis/Corrective profiles from the
//! on-disk YAML tree, serves lock-free `Arc` snapshots to readers, and
//! atomically swaps in a new snapshot on `reload()` — either triggered
//! explicitly (the daemon's `reload` CLI subcommand) or by the file watcher
//! noticing a change under the profile config directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{info, warn};

use vq_core::domain::{AnalysisType, QaTier};

use crate::profile::{AnalysisProfile, CorrectiveProfile, ProfileError, ProfileSet};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("profile error: {0}")]
    Profile(#[from] ProfileError),
    #[error("io error reading {0}: {1}")]
    Io(String, String),
}

/// A single subscriber callback, invoked (with the new generation number)
/// after a successful reload swaps in a new snapshot. Subscribers run
/// off the lock — notification happens after the `RwLock` write guard is
/// dropped, so a slow subscriber never blocks readers or the next reload.
pub type ReloadSubscriber = Box<dyn Fn(usize) + Send + Sync>;

/// Serves validated Analysis/Corrective profiles to the rest of the system.
///
/// Reads are lock-free in practice: `current()` clones an `Arc<ProfileSet>`
/// under a short read lock. Reloads rebuild the entire `ProfileSet` from
/// disk off to the side and only take the write lock to swap the `Arc` in,
/// so a reload never holds readers up while YAML is being parsed.
pub struct ConfigRegistry {
    root: PathBuf,
    current: RwLock<Arc<ProfileSet>>,
    generation: AtomicUsize,
    subscribers: RwLock<Vec<ReloadSubscriber>>,
}

fn read_yaml_dir(dir: &Path) -> Result<Vec<(String, String)>, RegistryError> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir).map_err(|e| RegistryError::Io(dir.display().to_string(), e.to_string()))? {
        let entry = entry.map_err(|e| RegistryError::Io(dir.display().to_string(), e.to_string()))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let text = fs::read_to_string(&path)
            .map_err(|e| RegistryError::Io(path.display().to_string(), e.to_string()))?;
        out.push((path.display().to_string(), text));
    }
    Ok(out)
}

impl ConfigRegistry {
    /// Loads and validates the full profile tree under `root`:
    /// `root/analysis/*.yaml` and `root/corrective/<type>/<tier>.yaml`.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let root = root.into();
        let set = Self::load_profile_set(&root)?;
        Ok(Self {
            root,
            current: RwLock::new(Arc::new(set)),
            generation: AtomicUsize::new(0),
            subscribers: RwLock::new(Vec::new()),
        })
    }

    fn load_profile_set(root: &Path) -> Result<ProfileSet, RegistryError> {
        let analysis_docs = read_yaml_dir(&root.join("analysis"))?;

        let mut corrective_docs = Vec::new();
        let corrective_root = root.join("corrective");
        if corrective_root.exists() {
            for entry in fs::read_dir(&corrective_root)
                .map_err(|e| RegistryError::Io(corrective_root.display().to_string(), e.to_string()))?
            {
                let entry = entry.map_err(|e| RegistryError::Io(corrective_root.display().to_string(), e.to_string()))?;
                if entry.path().is_dir() {
                    corrective_docs.extend(read_yaml_dir(&entry.path())?);
                }
            }
        }

        Ok(ProfileSet::from_documents(analysis_docs, corrective_docs)?)
    }

    /// Returns the current validated snapshot. Cheap: one `Arc` clone under
    /// a read lock.
    pub fn current(&self) -> Arc<ProfileSet> {
        self.current.read().expect("registry lock poisoned").clone()
    }

    pub fn get_analysis_profile(&self, t: AnalysisType) -> Option<AnalysisProfile> {
        self.current().get_analysis(t).cloned()
    }

    pub fn get_corrective_profile(&self, t: AnalysisType, tier: QaTier) -> Option<CorrectiveProfile> {
        self.current().get_corrective(t, tier).cloned()
    }

    pub fn generation(&self) -> usize {
        self.generation.load(Ordering::Acquire)
    }

    /// Registers a callback invoked after every successful reload.
    pub fn subscribe(&self, callback: ReloadSubscriber) {
        self.subscribers.write().expect("registry lock poisoned").push(callback);
    }

    /// Re-reads and re-validates the profile tree from disk and swaps it in
    /// only if the whole tree parses and validates cleanly — a reload that
    /// fails validation leaves the previously loaded profiles in place
    /// (spec: "an invalid reload request is rejected and the previous
    /// configuration remains active").
    pub fn reload(&self) -> Result<usize, RegistryError> {
        let set = match Self::load_profile_set(&self.root) {
            Ok(set) => set,
            Err(e) => {
                warn!(error = %e, "config reload rejected, keeping previous snapshot");
                return Err(e);
            }
        };
        {
            let mut guard = self.current.write().expect("registry lock poisoned");
            *guard = Arc::new(set);
        }
        let gen = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!(generation = gen, "config registry reloaded");
        for sub in self.subscribers.read().expect("registry lock poisoned").iter() {
            sub(gen);
        }
        Ok(gen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc as StdArc;

    fn write_minimal_tree(root: &Path) {
        let analysis_dir = root.join("analysis");
        let corrective_dir = root.join("corrective");
        fs::create_dir_all(&analysis_dir).unwrap();
        for t in AnalysisType::ALL {
            let yaml = format!(
                "analysis_type: {}\nmodel: vision-analysis\nsystem_prompt_template: \"go\"\nuser_prompt_template: \"{{{{IMAGE}}}}\"\noutput_schema: {{}}\nprohibited_phrases: [\"x\"]\n",
                t.slug()
            );
            fs::write(analysis_dir.join(format!("{}.yaml", t.slug())), yaml).unwrap();

            let tier_dir = corrective_dir.join(t.slug());
            fs::create_dir_all(&tier_dir).unwrap();
            for tier in QaTier::ORDER {
                let yaml = format!(
                    "analysis_type: {}\ntier: {}\nmodel: vision-qa\nmax_attempts: 3\nsystem_prompt_template: \"go\"\nuser_prompt_template: \"{{{{PRIOR_OUTPUT}}}} {{{{IMAGE}}}}\"\noutput_schema: {{}}\nprohibited_phrases: [\"x\"]\n",
                    t.slug(),
                    tier.slug()
                );
                fs::write(tier_dir.join(format!("{}.yaml", tier.slug())), yaml).unwrap();
            }
        }
    }

    #[test]
    fn loads_complete_tree() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_tree(dir.path());
        let registry = ConfigRegistry::load(dir.path()).unwrap();
        let snapshot = registry.current();
        assert_eq!(snapshot.analysis.len(), 21);
        assert_eq!(snapshot.corrective.len(), 63);
    }

    #[test]
    fn incomplete_tree_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("analysis")).unwrap();
        assert!(ConfigRegistry::load(dir.path()).is_err());
    }

    #[test]
    fn reload_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_tree(dir.path());
        let registry = ConfigRegistry::load(dir.path()).unwrap();
        assert_eq!(registry.generation(), 0);

        let path = dir.path().join("analysis/object_detection.yaml");
        let updated = "analysis_type: object_detection\nmodel: vision-analysis-v2\nsystem_prompt_template: \"go\"\nuser_prompt_template: \"{{IMAGE}}\"\noutput_schema: {}\nprohibited_phrases: [\"x\"]\n";
        fs::write(&path, updated).unwrap();

        let gen = registry.reload().unwrap();
        assert_eq!(gen, 1);
        let snapshot = registry.current();
        assert_eq!(
            snapshot.get_analysis(AnalysisType::ObjectDetection).unwrap().model,
            "vision-analysis-v2"
        );
    }

    #[test]
    fn reload_with_broken_yaml_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_tree(dir.path());
        let registry = ConfigRegistry::load(dir.path()).unwrap();

        let path = dir.path().join("analysis/object_detection.yaml");
        fs::write(&path, "not: [valid").unwrap();

        assert!(registry.reload().is_err());
        assert_eq!(registry.generation(), 0);
        let snapshot = registry.current();
        assert_eq!(
            snapshot.get_analysis(AnalysisType::ObjectDetection).unwrap().model,
            "vision-analysis"
        );
    }

    #[test]
    fn subscribers_notified_after_reload() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_tree(dir.path());
        let registry = ConfigRegistry::load(dir.path()).unwrap();

        let notified = StdArc::new(AtomicBool::new(false));
        let notified_clone = notified.clone();
        registry.subscribe(Box::new(move |_gen| {
            notified_clone.store(true, Ordering::SeqCst);
        }));

        registry.reload().unwrap();
        assert!(notified.load(Ordering::SeqCst));
    }
}
