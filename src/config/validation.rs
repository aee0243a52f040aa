use super::defaults::MAX_TERM_LEN;
use super::BridgeConfig;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

impl BridgeConfig {
    /// Check CLI values and normalize paths.
    pub fn validate(&mut self) -> Result<()> {
        validate_term(&self.term)?;

        if let Some(dir) = self.dir.take() {
            self.dir = Some(existing_dir(&dir, "--dir")?);
        }
        if let Some(dir) = self.log_dir.take() {
            self.log_dir = Some(existing_dir(&dir, "--log")?);
        }
        if let Some(dir) = &self.connector_dir {
            if !dir.is_dir() {
                bail!("--connector-dir {} is not a directory", dir.display());
            }
        }
        if let Some(prefix) = &self.mount_prefix {
            if prefix.contains('\0') {
                bail!("--mount-prefix must not contain NUL bytes");
            }
        }
        if let Some(arg) = self.command.iter().find(|arg| arg.contains('\0')) {
            bail!("command argument {arg:?} contains a NUL byte");
        }
        if self.command.first().is_some_and(|first| first.is_empty()) {
            bail!("command must not be empty");
        }
        Ok(())
    }
}

fn validate_term(term: &str) -> Result<()> {
    if term.is_empty() {
        bail!("--term must not be empty");
    }
    if term.len() > MAX_TERM_LEN {
        bail!("--term must be at most {MAX_TERM_LEN} bytes");
    }
    if !term
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '+'))
    {
        bail!("--term contains unsupported characters: {term:?}");
    }
    Ok(())
}

fn existing_dir(dir: &Path, flag: &str) -> Result<PathBuf> {
    let canonical = dir
        .canonicalize()
        .with_context(|| format!("{flag} {} does not exist", dir.display()))?;
    if !canonical.is_dir() {
        bail!("{flag} {} is not a directory", dir.display());
    }
    Ok(canonical)
}
