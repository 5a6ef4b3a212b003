//! `.screencrawl/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::io::config::{CrawlConfig, write_config};

/// Canonical paths within `.screencrawl/` for a project root.
#[derive(Debug, Clone)]
pub struct CrawlPaths {
    pub root: PathBuf,
    pub crawl_dir: PathBuf,
    /// Agent schemas and per-call logs.
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub description_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl CrawlPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let crawl_dir = root.join(".screencrawl");
        Self {
            state_dir: crawl_dir.join("state"),
            config_path: crawl_dir.join("config.toml"),
            description_path: crawl_dir.join("description.md"),
            gitignore_path: crawl_dir.join(".gitignore"),
            crawl_dir,
            root,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InitOptions {
    /// Overwrite existing screencrawl-owned files.
    pub force: bool,
}

/// Create `.screencrawl/` in `root`.
///
/// Fails if it already exists unless `options.force` is set.
pub fn init_workspace(root: &Path, options: InitOptions) -> Result<CrawlPaths> {
    let paths = CrawlPaths::new(root);
    if paths.crawl_dir.exists() && !paths.crawl_dir.is_dir() {
        bail!("init: .screencrawl exists but is not a directory");
    }
    if paths.crawl_dir.exists() && !options.force {
        bail!("init: .screencrawl already exists (use --force to overwrite)");
    }

    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("create directory {}", paths.state_dir.display()))?;
    write_config(&paths.config_path, &CrawlConfig::default())?;
    write_file(&paths.description_path, DESCRIPTION_PLACEHOLDER)?;
    write_file(&paths.gitignore_path, GITIGNORE)?;
    Ok(paths)
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const DESCRIPTION_PLACEHOLDER: &str = "\
# Main
- Home screen
- Settings screen [expect: Settings]

# Success criteria
- Every listed screen captured
";
const GITIGNORE: &str = "state/\n";
