//! Locating the numbered result files a planner leaves behind.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFile {
    /// Trailing sequence number, `plan.3` -> 3.
    pub index: u32,
    pub path: PathBuf,
}

fn result_pattern(basename: &str) -> io::Result<Regex> {
    if basename.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "result basename is empty",
        ));
    }
    let pattern = format!(r"^{}\.(\d+)$", regex::escape(basename));
    Regex::new(&pattern).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
}

fn result_index(pattern: &Regex, file_name: &str) -> Option<u32> {
    let digits = pattern.captures(file_name)?.get(1)?.as_str();
    match digits.parse::<u32>() {
        Ok(0) | Err(_) => None,
        Ok(index) => Some(index),
    }
}

/// Files in `dir` named `<basename>.<n>` for a positive integer `n`, sorted
/// by `n`. Only `dir` itself is searched; a missing directory yields nothing.
pub fn discover_results(dir: &Path, basename: &str) -> io::Result<Vec<ResultFile>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "Result directory does not exist");
            return Ok(Vec::new());
        }
        Err(err) => return Err(err),
    };

    let pattern = result_pattern(basename)?;
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(index) = result_index(&pattern, name) {
            debug!(index, file = %entry.path().display(), "Found result file");
            found.push(ResultFile {
                index,
                path: entry.path(),
            });
        }
    }
    found.sort_by_key(|result| result.index);
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_only_numbered_siblings() {
        let pattern = result_pattern("result").unwrap();
        assert_eq!(result_index(&pattern, "result.1"), Some(1));
        assert_eq!(result_index(&pattern, "result.12"), Some(12));
        assert_eq!(result_index(&pattern, "result"), None);
        assert_eq!(result_index(&pattern, "result.a"), None);
        assert_eq!(result_index(&pattern, "result.1x"), None);
        assert_eq!(result_index(&pattern, "xresult.1"), None);
        assert_eq!(result_index(&pattern, "result.0"), None);
        assert_eq!(result_index(&pattern, "result.99999999999"), None);
    }

    #[test]
    fn basename_is_matched_literally() {
        let pattern = result_pattern("plan.out").unwrap();
        assert_eq!(result_index(&pattern, "plan.out.2"), Some(2));
        assert_eq!(result_index(&pattern, "planXout.2"), None);
    }

    #[test]
    fn results_come_back_sorted_by_index() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["plan.10", "plan.2", "plan.1", "plan", "plan.b", "notes.1"] {
            fs::write(dir.path().join(name), "(noop)").unwrap();
        }
        fs::create_dir(dir.path().join("plan.3")).unwrap();

        let found = discover_results(dir.path(), "plan").unwrap();
        let indices: Vec<u32> = found.iter().map(|result| result.index).collect();
        assert_eq!(indices, vec![1, 2, 10]);
        assert_eq!(found[0].path, dir.path().join("plan.1"));
    }

    #[test]
    fn empty_basename_is_an_input_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".1"), "(noop)").unwrap();
        let err = discover_results(dir.path(), "").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let found = discover_results(&dir.path().join("absent"), "plan").unwrap();
        assert!(found.is_empty());
    }
}
