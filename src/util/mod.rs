use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Ensure a directory exists, creating missing parents.
pub fn ensure_dir(dir: &Path) -> Result<(), UtilError> {
    if !dir.is_dir() {
        fs::create_dir_all(dir).map_err(|e| {
            UtilError::InvalidParams(format!(
                "Failed to create directory {}: {e}",
                dir.display()
            ))
        })?;
    }
    Ok(())
}

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
}

/// Optional entry appended to a checkpoint name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamePattern {
    None,
    /// Zero-padded to six digits, `_000042`.
    Index(usize),
    Label(String),
}

impl fmt::Display for NamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamePattern::None => Ok(()),
            NamePattern::Index(index) => write!(f, "_{index:06}"),
            NamePattern::Label(label) => write!(f, "_{label}"),
        }
    }
}

/// Builds `<dir>/<name><pattern>.<ext>`, `None` when no directory is given.
///
/// `ext` may be passed with or without its leading dot.
///
/// ```rust
/// use calibtool::util::{savename_pattern, NamePattern};
/// use std::path::{Path, PathBuf};
///
/// let path = savename_pattern(Some(Path::new("out")), "pcl", NamePattern::Index(3), ".ply");
/// assert_eq!(path, Some(PathBuf::from("out/pcl_000003.ply")));
/// assert_eq!(savename_pattern(None, "pcl", NamePattern::None, "ply"), None);
/// ```
pub fn savename_pattern(
    dir: Option<&Path>,
    name: &str,
    pattern: NamePattern,
    ext: &str,
) -> Option<PathBuf> {
    let dir = dir?;
    let ext = ext.trim_start_matches('.');
    Some(dir.join(format!("{name}{pattern}.{ext}")))
}
