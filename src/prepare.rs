//! Launch preparation: isolated session home and credential files.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use uuid::Uuid;

/// A config/credential file the supervised process expects inside its home
/// directory, addressed relative to that directory.
#[derive(Debug, Clone)]
pub struct CredentialFile {
    pub relative_path: String,
    pub contents: String,
}

/// Create a fresh, isolated home directory for one session.
///
/// Home-directory shorthand (`~`) is rejected rather than expanded: the
/// caller must hand over a concrete path so the session cannot silently
/// land in the operator's real home.
pub fn prepare_home(workspace: &Path, override_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = override_dir {
        if dir.to_string_lossy().starts_with('~') {
            bail!(
                "home dir override '{}' uses ~ shorthand, pass an absolute path",
                dir.display()
            );
        }
    }

    if !workspace.is_dir() {
        bail!("workspace '{}' does not exist", workspace.display());
    }

    let home = match override_dir {
        Some(dir) => dir.to_path_buf(),
        None => workspace
            .join(".sessions")
            .join(format!("session-{}", Uuid::new_v4().simple())),
    };

    std::fs::create_dir_all(&home)
        .with_context(|| format!("failed to create session home '{}'", home.display()))?;

    Ok(home)
}

/// Write credential/config files into the session home before launch.
pub fn write_credentials(home: &Path, files: &[CredentialFile]) -> Result<()> {
    for file in files {
        let rel = Path::new(&file.relative_path);
        if rel.is_absolute() || rel.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            bail!(
                "credential path '{}' must be relative and inside the session home",
                file.relative_path
            );
        }

        let target = home.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create '{}'", parent.display()))?;
        }
        std::fs::write(&target, &file.contents)
            .with_context(|| format!("failed to write '{}'", target.display()))?;
    }
    Ok(())
}
