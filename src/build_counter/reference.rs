use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Resolves the human-readable reference (`git describe`) of a branch head.
pub trait ReferenceResolver {
    fn resolve(&self, repository: &str, branch: &str) -> Result<String>;
}

/// Resolves references through local clones kept in a cache directory.
pub struct GitReferenceResolver {
    cache_dir: PathBuf,
}

impl GitReferenceResolver {
    pub fn new<P: Into<PathBuf>>(cache_dir: P) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Directory of the local clone: the repository's base name without extension.
    pub fn local_dir(&self, repository: &str) -> PathBuf {
        let base = repository
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(repository);
        let name = Path::new(base)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| base.to_string());
        self.cache_dir.join(name)
    }

    fn git(dir: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .stderr(Stdio::null())
            .output()
            .with_context(|| format!("Failed to execute git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!("git {} failed with {}", args.join(" "), output.status);
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl ReferenceResolver for GitReferenceResolver {
    fn resolve(&self, repository: &str, branch: &str) -> Result<String> {
        std::fs::create_dir_all(&self.cache_dir)
            .with_context(|| format!("Failed to create git cache {:?}", self.cache_dir))?;

        let local_dir = self.local_dir(repository);
        if !local_dir.is_dir() {
            info!("Cloning {} into {:?}", repository, self.cache_dir);
            let status = Command::new("git")
                .arg("clone")
                .arg(repository)
                .current_dir(&self.cache_dir)
                .status()
                .context("Failed to execute git clone")?;
            if !status.success() {
                bail!("git clone {} failed with {}", repository, status);
            }
        }

        Self::git(&local_dir, &["fetch", "origin", branch])?;
        let reference = Self::git(&local_dir, &["describe", "FETCH_HEAD"])?;
        let reference = reference.trim().to_string();
        debug!("{}:{} resolved to {}", repository, branch, reference);
        Ok(reference)
    }
}
