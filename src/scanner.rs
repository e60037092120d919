use crate::{
    error::{Error, Result},
    file::{is_binary_file, is_readable},
};
use globset::{Glob, GlobMatcher, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, trace, warn};

/// Input name standing for standard input.
pub const STDIN_PATH: &str = "-";

/// File enumeration options.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Descend into subdirectories
    pub recursive: bool,

    /// Follow symbolic links while walking
    pub follow_links: bool,

    /// Glob patterns of paths to leave out
    pub exclude: Vec<String>,

    /// Keep files that look binary
    pub include_binary: bool,
}

/// Statistics collected during scanning.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ScanStats {
    /// Candidate files seen
    pub total_files: usize,

    /// Files left out by an exclude pattern
    pub excluded: usize,

    /// Binary files left out
    pub binary_files: usize,

    /// Files that could not be inspected
    pub errors: usize,
}

/// Turns command line paths into the sorted, de-duplicated list of input
/// files.
///
/// Each argument is one of:
/// - `-`, standard input, passed through
/// - a file
/// - a directory, whose files are listed (recursively if configured)
/// - a path whose last component is a glob, matched against file names in
///   the directory before it
///
/// Anything else is skipped with a debug message.
pub struct Scanner {
    options: ScanOptions,
    exclude: GlobSet,
}

impl Scanner {
    /// Creates a scanner, compiling the exclude patterns.
    ///
    /// # Errors
    ///
    /// Returns an invalid pattern error for a malformed exclude glob.
    pub fn new(options: ScanOptions) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &options.exclude {
            let glob =
                Glob::new(pattern).map_err(|e| Error::invalid_pattern(pattern, e.to_string()))?;
            builder.add(glob);
        }
        let exclude = builder
            .build()
            .map_err(|e| Error::invalid_pattern(options.exclude.join(", "), e.to_string()))?;

        Ok(Self { options, exclude })
    }

    /// Enumerates the input files named by `paths`.
    ///
    /// The result holds normalized paths, sorted and without duplicates.
    ///
    /// # Errors
    ///
    /// Returns an invalid pattern error for a malformed glob argument.
    pub fn scan<S: AsRef<str>>(&self, paths: &[S]) -> Result<Vec<String>> {
        let mut stats = ScanStats::default();
        let mut found = BTreeSet::new();

        for arg in paths {
            let arg = arg.as_ref();
            if arg == STDIN_PATH {
                found.insert(STDIN_PATH.to_string());
                continue;
            }

            for path in self.expand(arg)? {
                stats.total_files += 1;
                if let Some(path) = self.accept(&path, &mut stats) {
                    found.insert(path);
                }
            }
        }

        debug!(
            "Scan complete: {} total, {} excluded, {} binary, {} errors",
            stats.total_files, stats.excluded, stats.binary_files, stats.errors
        );

        Ok(found.into_iter().collect())
    }

    /// Lists the candidate files one argument stands for.
    fn expand(&self, arg: &str) -> Result<Vec<PathBuf>> {
        let path = Path::new(arg);

        if arg.contains(['*', '?', '[']) {
            let top = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let pattern = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let matcher = Glob::new(&pattern)
                .map_err(|e| Error::invalid_pattern(&pattern, e.to_string()))?
                .compile_matcher();

            return Ok(self.walk(top, Some(&matcher)));
        }

        if path.is_dir() {
            return Ok(self.walk(path, None));
        }

        if path.is_file() {
            return Ok(vec![path.to_path_buf()]);
        }

        debug!(path = arg, "Skipping: not a file or directory");
        Ok(Vec::new())
    }

    /// Lists files under `top` whose name matches `pattern`.
    fn walk(&self, top: &Path, pattern: Option<&GlobMatcher>) -> Vec<PathBuf> {
        let max_depth = if self.options.recursive { None } else { Some(1) };

        WalkBuilder::new(top)
            .standard_filters(false)
            .follow_links(self.options.follow_links)
            .max_depth(max_depth)
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Walk error: {}", e);
                    None
                }
            })
            .filter(|entry| match entry.file_type() {
                // a link kept unfollowed still counts when it points at a file
                Some(ft) if ft.is_symlink() => entry.path().is_file(),
                Some(ft) => ft.is_file(),
                None => false,
            })
            .filter(|entry| pattern.is_none_or(|m| m.is_match(entry.file_name())))
            .map(ignore::DirEntry::into_path)
            .collect()
    }

    /// Applies exclude patterns, the readability check and the binary check;
    /// returns the normalized path of a file to keep.
    fn accept(&self, path: &Path, stats: &mut ScanStats) -> Option<String> {
        let normalized = normalize_path(path);

        if self.exclude.is_match(&normalized) {
            trace!(path = %normalized, "Skipping: excluded");
            stats.excluded += 1;
            return None;
        }

        if !is_readable(path) {
            warn!("Skipping {}: cannot be opened for reading", normalized);
            stats.errors += 1;
            return None;
        }

        if !self.options.include_binary {
            match is_binary_file(path) {
                Ok(true) => {
                    debug!(path = %normalized, "Skipping binary file");
                    stats.binary_files += 1;
                    return None;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to inspect {}: {}", normalized, e);
                    stats.errors += 1;
                    return None;
                }
            }
        }

        Some(normalized)
    }
}

/// Lexically normalizes a path: drops `.` components, folds `dir/..` pairs
/// and unifies separators to `/`. Never touches the filesystem.
#[must_use]
pub fn normalize_path(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut prefix = String::new();

    for component in path.components() {
        match component {
            Component::Prefix(p) => prefix = p.as_os_str().to_string_lossy().into_owned(),
            Component::RootDir => prefix.push('/'),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.last().is_some_and(|last| last != "..") {
                    parts.pop();
                } else if prefix.is_empty() {
                    parts.push("..".to_string());
                }
            }
            Component::Normal(name) => parts.push(name.to_string_lossy().into_owned()),
        }
    }

    let joined = format!("{prefix}{}", parts.join("/")).replace('\\', "/");
    if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}
