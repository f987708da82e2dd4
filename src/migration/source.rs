//! Migration sources
//!
//! A [`MigrationSource`] hands the migrator a list of resources. Each resource
//! has a name, may or may not exist, and may fail to read; resources that do
//! not exist or cannot be read are dropped silently rather than failing the run.

use crate::migration::{Migration, MigrationError, MigrationOrder};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default pattern for migration file names
pub const DEFAULT_FILE_PATTERN: &str = r"\.cql$";

/// A single candidate migration
pub trait MigrationResource {
    /// Resource name, used as the migration name
    fn name(&self) -> Option<String>;

    fn exists(&self) -> bool;

    /// Read the migration statement
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the resource cannot be read.
    fn read(&self) -> io::Result<String>;
}

/// Supplies candidate migrations to the migrator
pub trait MigrationSource {
    /// List the candidate resources
    ///
    /// # Errors
    ///
    /// Returns `MigrationError` if the source as a whole is unusable, e.g. its
    /// directory does not exist.
    fn resources(&self) -> Result<Vec<Box<dyn MigrationResource + '_>>, MigrationError>;
}

impl Migration {
    /// Load a migration from a resource, `None` if it has no name or cannot be read
    pub fn from_resource(resource: &dyn MigrationResource) -> Option<Migration> {
        let name = resource.name()?;
        match resource.read() {
            Ok(statement) => Some(Migration::new(name, statement)),
            Err(e) => {
                log::debug!("Dropping unreadable migration {}: {}", name, e);
                None
            }
        }
    }
}

impl MigrationResource for Migration {
    fn name(&self) -> Option<String> {
        Some(Migration::name(self).to_string())
    }

    fn exists(&self) -> bool {
        true
    }

    fn read(&self) -> io::Result<String> {
        Ok(self.statement().to_string())
    }
}

impl<T: MigrationResource + ?Sized> MigrationResource for &T {
    fn name(&self) -> Option<String> {
        (**self).name()
    }

    fn exists(&self) -> bool {
        (**self).exists()
    }

    fn read(&self) -> io::Result<String> {
        (**self).read()
    }
}

impl MigrationSource for [Migration] {
    fn resources(&self) -> Result<Vec<Box<dyn MigrationResource + '_>>, MigrationError> {
        Ok(self
            .iter()
            .map(|m| Box::new(m) as Box<dyn MigrationResource + '_>)
            .collect())
    }
}

impl MigrationSource for Vec<Migration> {
    fn resources(&self) -> Result<Vec<Box<dyn MigrationResource + '_>>, MigrationError> {
        self.as_slice().resources()
    }
}

/// A migration stored in a file; its name is the file name
#[derive(Debug, Clone)]
pub struct FileResource {
    path: PathBuf,
}

impl FileResource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MigrationResource for FileResource {
    fn name(&self) -> Option<String> {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
    }

    fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn read(&self) -> io::Result<String> {
        fs::read_to_string(&self.path)
    }
}

impl MigrationSource for Vec<FileResource> {
    fn resources(&self) -> Result<Vec<Box<dyn MigrationResource + '_>>, MigrationError> {
        Ok(self
            .iter()
            .map(|r| Box::new(r) as Box<dyn MigrationResource + '_>)
            .collect())
    }
}

/// All files in a directory whose names match a pattern
///
/// Sub-directories are not scanned.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
    pattern: Regex,
}

impl DirectorySource {
    /// Scan `dir` for files ending in `.cql`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pattern: default_pattern(),
        }
    }

    /// Scan `dir` for files whose names match `pattern`
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidFormat` if `pattern` is not a valid regex.
    pub fn with_pattern(dir: impl Into<PathBuf>, pattern: &str) -> Result<Self, MigrationError> {
        let pattern = Regex::new(pattern).map_err(|e| {
            MigrationError::InvalidFormat(format!("Invalid file pattern '{}': {}", pattern, e))
        })?;
        Ok(Self {
            dir: dir.into(),
            pattern,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

static DEFAULT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(DEFAULT_FILE_PATTERN).expect("default migration file pattern is valid"));

fn default_pattern() -> Regex {
    DEFAULT_PATTERN.clone()
}

impl MigrationSource for DirectorySource {
    fn resources(&self) -> Result<Vec<Box<dyn MigrationResource + '_>>, MigrationError> {
        if !self.dir.is_dir() {
            return Err(MigrationError::FileNotFound(
                self.dir.to_string_lossy().to_string(),
            ));
        }

        let entries = fs::read_dir(&self.dir).map_err(|e| {
            MigrationError::FileNotFound(format!(
                "Failed to read migrations directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let mut resources: Vec<Box<dyn MigrationResource + '_>> = Vec::new();
        for entry in entries {
            // An entry that vanished mid-scan is just another unreadable migration
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| self.pattern.is_match(n));
            if matches && path.is_file() {
                resources.push(Box::new(FileResource::new(path)));
            }
        }
        Ok(resources)
    }
}

/// Load every existing, readable migration from `source`, sorted by `order`
///
/// # Errors
///
/// Returns the source's error if it cannot list its resources.
pub fn load_migrations(
    source: &dyn MigrationSource,
    order: &MigrationOrder,
) -> Result<Vec<Migration>, MigrationError> {
    let mut migrations: Vec<Migration> = source
        .resources()?
        .iter()
        .filter(|r| r.exists())
        .filter_map(|r| Migration::from_resource(&**r))
        .collect();
    migrations.sort_by(|a, b| order(a, b));
    Ok(migrations)
}
