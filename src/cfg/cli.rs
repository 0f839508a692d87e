// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Resolves a config-file path the way [`crate::cfg::config::Config::load_from_file`]
/// expects it: relative paths are joined against the current working
/// directory rather than whatever directory `serde_yaml` happened to be
/// invoked from, and the result is canonicalized so two different
/// relative spellings of the same file compare equal in logs.
pub fn resolve_config_path<P: AsRef<Path>>(rel: P) -> Result<PathBuf> {
    let p = rel.as_ref();

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_an_absolute_path_to_itself_canonicalized() {
        let here = std::env::current_dir().expect("cwd");
        let resolved = resolve_config_path(&here).expect("resolve");
        assert_eq!(resolved, here.canonicalize().expect("canonicalize"));
    }

    #[test]
    fn rejects_a_path_that_does_not_exist() {
        assert!(resolve_config_path("definitely/not/a/real/config/path.yaml").is_err());
    }
}
