//! Staged copies of the configuration tree pushed into test VMs.
//!
//! Each profile run gets its own local copy of the configuration source.
//! Healing actions rewrite files in that copy and the changed files are then
//! uploaded again, so the local stage always mirrors what the VM holds.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, SupervisorError};

/// Directory names never copied into a stage.
const SKIPPED_DIRS: &[&str] = &[".git", ".direnv"];

/// A local stage of the configuration tree and where it lives in the VM.
#[derive(Debug, Clone)]
pub struct DeployedConfig {
    local_root: PathBuf,
    remote_root: String,
}

impl DeployedConfig {
    /// Wraps an already staged tree.
    #[must_use]
    pub fn new(local_root: impl Into<PathBuf>, remote_root: impl Into<String>) -> Self {
        Self {
            local_root: local_root.into(),
            remote_root: remote_root.into(),
        }
    }

    /// Copies `source` into a fresh stage at `local_root`.
    ///
    /// Any previous content of `local_root` is removed. Symlinks and VCS
    /// metadata are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Deployment`] if the source is missing or the
    /// copy fails.
    pub fn stage(
        source: &Path,
        local_root: impl Into<PathBuf>,
        remote_root: impl Into<String>,
    ) -> Result<Self> {
        let local_root = local_root.into();

        if !source.is_dir() {
            return Err(SupervisorError::Deployment(format!(
                "configuration source {} is not a directory",
                source.display()
            )));
        }

        if local_root.exists() {
            fs::remove_dir_all(&local_root)?;
        }
        copy_tree(source, &local_root).map_err(|e| {
            SupervisorError::Deployment(format!(
                "cannot stage {} into {}: {e}",
                source.display(),
                local_root.display()
            ))
        })?;

        tracing::debug!(
            source = %source.display(),
            stage = %local_root.display(),
            "Staged configuration tree"
        );
        Ok(Self::new(local_root, remote_root))
    }

    /// Returns the local stage directory.
    #[must_use]
    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    /// Returns the directory inside the VM.
    #[must_use]
    pub fn remote_root(&self) -> &str {
        &self.remote_root
    }

    /// Resolves a tree-relative path inside the local stage.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Config`] for absolute paths or paths that
    /// leave the tree.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        validate_relative(relative)?;
        Ok(self.local_root.join(relative))
    }

    /// Returns the VM path of a tree-relative file.
    #[must_use]
    pub fn remote_path(&self, relative: &str) -> String {
        format!(
            "{}/{}",
            self.remote_root.trim_end_matches('/'),
            relative.trim_start_matches("./")
        )
    }

    /// Reads a file from the stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid or unreadable.
    pub fn read_file(&self, relative: &str) -> Result<String> {
        Ok(fs::read_to_string(self.resolve(relative)?)?)
    }

    /// Replaces a file in the stage with `content`, creating it if needed.
    ///
    /// The write goes through a sibling temporary file so readers never see a
    /// partial file.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid or the write fails.
    pub fn replace_file(&self, relative: &str, content: &str) -> Result<PathBuf> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(".nixtest-tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;

        Ok(path)
    }
}

fn validate_relative(relative: &str) -> Result<()> {
    let path = Path::new(relative);
    if relative.is_empty() {
        return Err(SupervisorError::Config("empty configuration path".to_string()));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SupervisorError::Config(format!(
                    "configuration path '{relative}' escapes the configuration tree"
                )));
            }
        }
    }
    Ok(())
}

fn copy_tree(source: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;

    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let name = entry.file_name();
        let target = dest.join(&name);

        if file_type.is_symlink() {
            tracing::trace!(path = %entry.path().display(), "Skipping symlink");
        } else if file_type.is_dir() {
            if SKIPPED_DIRS.iter().any(|skip| name == *skip) {
                continue;
            }
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}
