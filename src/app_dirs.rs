//! Resolve the on-disk location of the database snapshot.
//!
//! The engine takes the snapshot path as explicit configuration; these
//! helpers only compute the conventional default, respecting an environment
//! override while falling back to platform-appropriate locations provided by
//! the `directories` crate.

use std::env;
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use directories::ProjectDirs;

const QUALIFIER: &str = "io";
const ORGANIZATION: &str = "fsdb";
const APPLICATION: &str = "fsdb";

const DATA_DIR_ENV: &str = "FSDB_DATA_DIR";

/// File name of the snapshot inside the data directory.
pub const DATABASE_FILE_NAME: &str = "fsearch.db";

/// Return the platform-specific directory layout for the application.
fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
        .ok_or_else(|| anyhow!("unable to determine project directories"))
}

/// Resolve an override directory from an environment variable.
///
/// An empty string is treated the same as an unset value so that callers can
/// use shell defaults without worrying about trailing whitespace.
fn dir_from_env(name: &str) -> Option<PathBuf> {
    let value = env::var_os(name)?;
    if value.is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

/// Return the data directory that stores the database snapshot.
pub fn get_data_dir() -> Result<PathBuf> {
    if let Some(dir) = dir_from_env(DATA_DIR_ENV) {
        return Ok(dir);
    }

    Ok(project_dirs()?.data_local_dir().to_path_buf())
}

/// Return the default snapshot path, `<data-dir>/fsearch/fsearch.db`.
pub fn default_database_file() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("fsearch").join(DATABASE_FILE_NAME))
}
