//! Expansion of import sources into file lists

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};

use crate::config::ImportSource;
use crate::error::{Result, SessionError};

const GLOB_META: [char; 4] = ['*', '?', '[', '{'];

/// Resolve the files of an import source
///
/// With `import_all_files` the filter is a glob. Its leading components
/// without wildcards name the directory to search (relative to
/// `session_dir` unless absolute) and the rest is matched against paths
/// below it. `*` stays within one path component, `**` crosses them.
/// Otherwise the selected files are returned, relative paths resolved the
/// same way.
pub async fn expand_source(source: &ImportSource, session_dir: &Path) -> Result<Vec<PathBuf>> {
    if !source.import_all_files {
        return Ok(source
            .selected_files
            .iter()
            .map(|f| resolve(session_dir, f))
            .collect());
    }

    let (base, pattern) = split_pattern(&source.filter);
    if pattern.is_empty() {
        return Err(SessionError::InvalidPattern {
            pattern: source.filter.clone(),
            message: "no file name pattern".to_string(),
        });
    }
    let dir = match base {
        Some(base) => resolve(session_dir, Path::new(base)),
        None => session_dir.to_path_buf(),
    };
    let matcher = compile_glob(pattern)?;
    let recursive = pattern.contains('/');

    let mut files = Vec::new();
    let mut pending = vec![dir.clone()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if file_type.is_dir() {
                if recursive {
                    pending.push(path);
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            let matched = path
                .strip_prefix(&dir)
                .is_ok_and(|relative| matcher.is_match(relative));
            if matched {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Split a filter into its literal directory prefix and the glob below it
fn split_pattern(filter: &str) -> (Option<&str>, &str) {
    let literal_end = filter
        .match_indices('/')
        .map(|(i, _)| i)
        .take_while(|&i| !filter[..i].contains(GLOB_META))
        .last();
    match literal_end {
        Some(0) => (Some("/"), &filter[1..]),
        Some(i) => (Some(&filter[..i]), &filter[i + 1..]),
        None => (None, filter),
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Compile a path glob; `*` and `?` never match `/`
pub fn compile_glob(pattern: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| SessionError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_glob() {
        let glob = compile_glob("app-*.clef").unwrap();
        assert!(glob.is_match("app-2024.clef"));
        assert!(glob.is_match("app-.clef"));
        assert!(!glob.is_match("app-2024.clef.bak"));
        assert!(!glob.is_match("xapp-1.clef"));
        assert!(!glob.is_match("app-x/y.clef"));

        let glob = compile_glob("log[0-9].txt").unwrap();
        assert!(glob.is_match("log1.txt"));
        assert!(!glob.is_match("log12.txt"));
        assert!(!glob.is_match("log1xtxt"));

        let glob = compile_glob("**/*.clef").unwrap();
        assert!(glob.is_match("a.clef"));
        assert!(glob.is_match("2024/03/a.clef"));
    }

    #[test]
    fn test_invalid_glob() {
        assert!(matches!(
            compile_glob("log[.txt"),
            Err(SessionError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_split_pattern() {
        assert_eq!(split_pattern("*.clef"), (None, "*.clef"));
        assert_eq!(split_pattern("logs/app/*.clef"), (Some("logs/app"), "*.clef"));
        assert_eq!(split_pattern("logs/**/*.clef"), (Some("logs"), "**/*.clef"));
        assert_eq!(split_pattern("/a.clef"), (Some("/"), "a.clef"));
        assert_eq!(split_pattern("logs/"), (Some("logs"), ""));
    }

    #[tokio::test]
    async fn test_expand_glob_relative_to_session() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("logs")).unwrap();
        for name in ["b.clef", "a.clef", "notes.txt"] {
            std::fs::write(dir.path().join("logs").join(name), "").unwrap();
        }
        std::fs::create_dir(dir.path().join("logs").join("nested.clef")).unwrap();

        let source = ImportSource::glob("logs", "CLEF", "logs/*.clef");
        let files = expand_source(&source, dir.path()).await.unwrap();
        assert_eq!(
            files,
            vec![dir.path().join("logs/a.clef"), dir.path().join("logs/b.clef")]
        );
    }

    #[tokio::test]
    async fn test_expand_selected_files() {
        let source = ImportSource::files(
            "x",
            "CLEF",
            vec![PathBuf::from("rel.clef"), PathBuf::from("/abs/file.clef")],
        );
        let files = expand_source(&source, Path::new("/session")).await.unwrap();
        assert_eq!(
            files,
            vec![PathBuf::from("/session/rel.clef"), PathBuf::from("/abs/file.clef")]
        );
    }

    #[tokio::test]
    async fn test_missing_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = ImportSource::glob("x", "CLEF", "missing/*.clef");
        assert!(matches!(
            expand_source(&source, dir.path()).await,
            Err(SessionError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_expand_recursive_glob() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        std::fs::create_dir_all(logs.join("2024/03")).unwrap();
        std::fs::write(logs.join("top.clef"), "").unwrap();
        std::fs::write(logs.join("2024/03/day.clef"), "").unwrap();
        std::fs::write(logs.join("2024/03/day.txt"), "").unwrap();

        let nested = ImportSource::glob("logs", "CLEF", "logs/**/*.clef");
        assert_eq!(
            expand_source(&nested, dir.path()).await.unwrap(),
            vec![logs.join("2024/03/day.clef"), logs.join("top.clef")]
        );

        let flat = ImportSource::glob("logs", "CLEF", "logs/*.clef");
        assert_eq!(
            expand_source(&flat, dir.path()).await.unwrap(),
            vec![logs.join("top.clef")]
        );
    }

    #[tokio::test]
    async fn test_expand_without_file_pattern() {
        let source = ImportSource::glob("x", "CLEF", "logs/");
        assert!(matches!(
            expand_source(&source, Path::new("/session")).await,
            Err(SessionError::InvalidPattern { .. })
        ));
    }
}
