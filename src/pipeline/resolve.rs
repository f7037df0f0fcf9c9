//! Locating the stored original on disk.
//!
//! Uploads record their location relative to the working directory of the
//! process that saved them. The analysing process may run with a different
//! working directory (service managers, containers, a binary staged one level
//! below the project root), so a relative reference is probed against several
//! roots instead of assuming one canonical layout.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ResolveError {
    /// None of the candidate locations exists.
    #[error("stored file '{reference}' not found (tried: {})", display_paths(.tried))]
    NotFound {
        reference: String,
        tried: Vec<PathBuf>,
    },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Probes a stored-file reference against the known deployment roots.
#[derive(Debug, Clone)]
pub struct PathResolver {
    working_dir: PathBuf,
    install_dir: Option<PathBuf>,
}

impl PathResolver {
    pub fn new(working_dir: impl Into<PathBuf>, install_dir: Option<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            install_dir,
        }
    }

    /// Build from the running process: current directory and the directory
    /// holding the executable.
    pub fn from_process() -> Self {
        let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let install_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        Self::new(working_dir, install_dir)
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dir = Some(dir.into());
        self
    }

    /// Candidate locations for `reference`, in probe order.
    pub fn candidates(&self, reference: &str) -> Vec<PathBuf> {
        let path = Path::new(reference);
        if path.is_absolute() {
            return vec![path.to_path_buf()];
        }

        let mut out = vec![self.working_dir.join(path)];
        if let Some(install) = &self.install_dir {
            out.push(install.join(path));
            if let Some(parent) = install.parent().filter(|p| !p.as_os_str().is_empty()) {
                out.push(parent.join(path));
            }
        }
        out
    }

    /// Return the first candidate that exists.
    ///
    /// There is no fallback: a reference that exists nowhere is `NotFound`,
    /// never a plausible-looking path that the caller would then fail to open.
    pub fn resolve(&self, reference: &str) -> Result<PathBuf, ResolveError> {
        let tried = self.candidates(reference);
        match tried.iter().find(|c| c.is_file()) {
            Some(found) => {
                debug!("Resolved '{}' → {}", reference, found.display());
                Ok(found.clone())
            }
            None => Err(ResolveError::NotFound {
                reference: reference.to_string(),
                tried,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct Layout {
        _root: tempfile::TempDir,
        cwd: PathBuf,
        install: PathBuf,
        project: PathBuf,
    }

    /// project/            ← parent of the install dir
    ///   publish/          ← install dir
    /// elsewhere/          ← working dir
    fn layout() -> Layout {
        let root = tempfile::tempdir().unwrap();
        let project = root.path().join("project");
        let install = project.join("publish");
        let cwd = root.path().join("elsewhere");
        fs::create_dir_all(&install).unwrap();
        fs::create_dir_all(&cwd).unwrap();
        Layout {
            _root: root,
            cwd,
            install,
            project,
        }
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"%PDF-1.7").unwrap();
    }

    #[test]
    fn working_dir_wins_first() {
        let l = layout();
        let rel = "storage/original-uploads/a.pdf";
        touch(&l.cwd.join(rel));
        touch(&l.install.join(rel));

        let resolver = PathResolver::new(&l.cwd, Some(l.install.clone()));
        assert_eq!(resolver.resolve(rel).unwrap(), l.cwd.join(rel));
    }

    #[test]
    fn install_dir_candidate_is_found() {
        let l = layout();
        let rel = "storage/original-uploads/b.pdf";
        touch(&l.install.join(rel));

        let resolver = PathResolver::new(&l.cwd, Some(l.install.clone()));
        assert_eq!(resolver.resolve(rel).unwrap(), l.install.join(rel));
    }

    #[test]
    fn parent_of_install_dir_is_tried_last() {
        let l = layout();
        let rel = "storage/c.pdf";
        touch(&l.project.join(rel));

        let resolver = PathResolver::new(&l.cwd, Some(l.install.clone()));
        assert_eq!(resolver.resolve(rel).unwrap(), l.project.join(rel));
    }

    #[test]
    fn missing_everywhere_is_not_found() {
        let l = layout();
        let resolver = PathResolver::new(&l.cwd, Some(l.install.clone()));
        let err = resolver.resolve("storage/none.pdf").unwrap_err();
        let ResolveError::NotFound { tried, .. } = &err;
        assert_eq!(tried.len(), 3);
        assert!(err.to_string().contains("none.pdf"));
    }

    #[test]
    fn absolute_reference_must_exist() {
        let l = layout();
        let abs = l.project.join("abs.pdf");
        let resolver = PathResolver::new(&l.cwd, Some(l.install.clone()));
        assert!(resolver.resolve(abs.to_str().unwrap()).is_err());

        touch(&abs);
        assert_eq!(resolver.resolve(abs.to_str().unwrap()).unwrap(), abs);
    }

    #[test]
    fn directories_do_not_count_as_files() {
        let l = layout();
        fs::create_dir_all(l.cwd.join("storage/dir.pdf")).unwrap();
        let resolver = PathResolver::new(&l.cwd, None);
        assert!(resolver.resolve("storage/dir.pdf").is_err());
    }
}
