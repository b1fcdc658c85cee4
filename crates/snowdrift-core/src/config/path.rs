//! Command-line config sources.

use std::path::{Path, PathBuf};

use clap::Parser;

/// Where a piece of configuration comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigPath {
    File(PathBuf),
    /// Every `.yaml`/`.yml` file directly inside, loaded in name order.
    Dir(PathBuf),
}

/// Check if a path has a YAML extension.
pub fn is_yaml_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    )
}

#[derive(Parser, Debug)]
#[command(version, about = "Stream object-storage exports through filter pipelines")]
pub struct CliArgs {
    /// Path to a configuration file (repeatable)
    #[arg(short, long)]
    pub config: Vec<PathBuf>,

    /// Path to a configuration directory (repeatable)
    #[arg(short = 'C', long = "config-dir")]
    pub config_dirs: Vec<PathBuf>,

    /// Only run the named pipelines (repeatable; default runs all)
    #[arg(short, long = "pipeline")]
    pub pipelines: Vec<String>,
}

impl CliArgs {
    /// Files first, then directories, each group in argument order.
    pub fn config_paths(&self) -> Vec<ConfigPath> {
        self.config
            .iter()
            .cloned()
            .map(ConfigPath::File)
            .chain(self.config_dirs.iter().cloned().map(ConfigPath::Dir))
            .collect()
    }

    /// Whether the pipeline named `key` was selected on the command line.
    pub fn selects(&self, key: &str) -> bool {
        self.pipelines.is_empty() || self.pipelines.iter().any(|p| p == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_yaml_file() {
        assert!(is_yaml_file(Path::new("pipelines.yaml")));
        assert!(is_yaml_file(Path::new("dir/pipelines.yml")));
        assert!(!is_yaml_file(Path::new("pipelines.toml")));
        assert!(!is_yaml_file(Path::new("yaml")));
    }

    #[test]
    fn test_config_paths_order() {
        let args = CliArgs::parse_from(["snowdrift", "-C", "conf.d", "-c", "a.yaml", "-c", "b.yaml"]);
        assert_eq!(
            args.config_paths(),
            vec![
                ConfigPath::File("a.yaml".into()),
                ConfigPath::File("b.yaml".into()),
                ConfigPath::Dir("conf.d".into()),
            ]
        );
    }

    #[test]
    fn test_pipeline_selection() {
        let all = CliArgs::parse_from(["snowdrift", "-c", "a.yaml"]);
        assert!(all.selects("anything"));

        let some = CliArgs::parse_from(["snowdrift", "-c", "a.yaml", "-p", "inventory"]);
        assert!(some.selects("inventory"));
        assert!(!some.selects("exports"));
    }
}
