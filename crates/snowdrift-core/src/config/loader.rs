//! Multi-file configuration loading.

use std::path::Path;

use snafu::prelude::*;

use super::{ConfigPath, interpolate, is_yaml_file};
use crate::error::{
    ConfigError, EnvInterpolationSnafu, MultipleErrorsSnafu, ReadDirSnafu, ReadFileSnafu,
    UnsupportedFormatSnafu,
};

/// A config document that can absorb another one loaded from a later file.
pub trait Mergeable: Sized + Default {
    /// Parse one interpolated YAML document.
    fn parse_yaml(contents: &str) -> Result<Self, ConfigError>;

    /// Fold `other` into `self`, rejecting duplicate component keys.
    fn merge(&mut self, other: Self) -> Result<(), ConfigError>;
}

/// Load and merge every config file named by `paths`.
///
/// All failures are collected so a single run reports every broken file.
pub fn load_from_paths<C: Mergeable>(paths: &[ConfigPath]) -> Result<C, ConfigError> {
    let mut config = C::default();
    let mut errors = Vec::new();

    for path in paths {
        let (label, loaded) = match path {
            ConfigPath::File(file) => (file.as_path(), load_file::<C>(file)),
            ConfigPath::Dir(dir) => (dir.as_path(), load_dir::<C>(dir)),
        };
        match loaded.and_then(|partial| config.merge(partial)) {
            Ok(()) => {}
            Err(e) => errors.push(format!("{}: {}", label.display(), e)),
        }
    }

    ensure!(errors.is_empty(), MultipleErrorsSnafu { errors });
    Ok(config)
}

fn load_file<C: Mergeable>(path: &Path) -> Result<C, ConfigError> {
    ensure!(
        is_yaml_file(path),
        UnsupportedFormatSnafu {
            path: path.to_path_buf()
        }
    );

    let contents = std::fs::read_to_string(path).context(ReadFileSnafu)?;
    let expanded = interpolate(&contents);
    ensure!(
        expanded.is_ok(),
        EnvInterpolationSnafu {
            message: expanded.errors.join("\n")
        }
    );

    C::parse_yaml(&expanded.text)
}

fn load_dir<C: Mergeable>(dir: &Path) -> Result<C, ConfigError> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .context(ReadDirSnafu {
            path: dir.to_path_buf(),
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_yaml_file(path))
        .collect();
    files.sort();

    let mut config = C::default();
    for file in files {
        config.merge(load_file::<C>(&file)?)?;
    }
    Ok(config)
}
