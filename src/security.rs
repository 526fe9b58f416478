//! Path containment checks.
//!
//! Every path that crosses a trust boundary goes through here: relative paths
//! coming from a scan or a caller-supplied list, output names joined onto the
//! output directory, and cache record names joined onto the cache directory.
//! Normalization always happens before comparison, so encoded or
//! backslash-separated traversal cannot slip past a lexical check.

use std::borrow::Cow;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Reasons a path is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SecurityViolation {
    /// Path contains a `..` segment.
    #[error("path traversal in '{path}'")]
    PathTraversal {
        /// Offending path as given
        path: String,
    },

    /// Path contains a `..` segment hidden behind percent-encoding.
    #[error("encoded path traversal in '{path}'")]
    EncodedTraversal {
        /// Offending path as given
        path: String,
    },

    /// Path is absolute or carries a drive/UNC prefix.
    #[error("absolute path '{path}' is not allowed")]
    AbsolutePath {
        /// Offending path as given
        path: String,
    },

    /// Path is empty or contains a NUL byte.
    #[error("invalid path '{path}'")]
    InvalidPath {
        /// Offending path as given
        path: String,
    },

    /// Resolved path does not live under the expected root.
    #[error("'{path}' resolves outside of '{root}'")]
    OutsideRoot {
        /// Resolved path
        path: PathBuf,
        /// Root it had to stay within
        root: PathBuf,
    },

    /// Entry is a symbolic link and links are not followed.
    #[error("'{path}' is a symbolic link")]
    SymlinkNotAllowed {
        /// Link path
        path: PathBuf,
    },

    /// Symbolic link resolves outside the repository or cannot be resolved.
    #[error("symbolic link '{path}' escapes the repository: {reason}")]
    SymlinkEscape {
        /// Link path
        path: PathBuf,
        /// Where it points, or why it could not be resolved
        reason: String,
    },
}

impl SecurityViolation {
    /// Returns true for the two symlink-related violations.
    #[must_use]
    pub const fn is_symlink(&self) -> bool {
        matches!(
            self,
            Self::SymlinkNotAllowed { .. } | Self::SymlinkEscape { .. }
        )
    }
}

/// Normalizes a repository-relative path into its slash-separated form.
///
/// Backslashes count as separators, `.` and empty segments are dropped.
/// Any `..` segment, an absolute or drive-prefixed path, a NUL byte or an
/// empty result is rejected. Percent-encoded dots and separators are decoded
/// for inspection only; the returned path keeps the original spelling.
///
/// # Errors
///
/// Returns the [`SecurityViolation`] describing why the path was refused.
pub fn normalize_relative(raw: &str) -> Result<String, SecurityViolation> {
    if raw.contains('\0') {
        return Err(SecurityViolation::InvalidPath {
            path: raw.to_string(),
        });
    }

    let decoded = decode_escapes(raw);
    let encoded = decoded.as_ref() != raw;

    for candidate in [raw, decoded.as_ref()] {
        let unified = candidate.replace('\\', "/");
        if is_absolute_form(&unified) {
            return Err(SecurityViolation::AbsolutePath {
                path: raw.to_string(),
            });
        }
        if unified.split('/').any(|segment| segment == "..") {
            return Err(if encoded && candidate != raw {
                SecurityViolation::EncodedTraversal {
                    path: raw.to_string(),
                }
            } else {
                SecurityViolation::PathTraversal {
                    path: raw.to_string(),
                }
            });
        }
    }

    let unified = raw.replace('\\', "/");
    let segments: Vec<&str> = unified
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();

    if segments.is_empty() {
        return Err(SecurityViolation::InvalidPath {
            path: raw.to_string(),
        });
    }

    Ok(segments.join("/"))
}

/// Validates that `relative_path` joined onto `output_root` stays inside it.
///
/// # Errors
///
/// Returns a [`SecurityViolation`] if the path fails normalization or the
/// joined path escapes `output_root`.
pub fn validate_output_path(
    output_root: &Path,
    relative_path: &str,
) -> Result<PathBuf, SecurityViolation> {
    let normalized = normalize_relative(relative_path)?;
    let candidate = output_root.join(&normalized);

    let lexically_inside = candidate.starts_with(output_root)
        && !candidate
            .strip_prefix(output_root)
            .map_or(true, |rest| {
                rest.components()
                    .any(|c| !matches!(c, Component::Normal(_)))
            });
    if !lexically_inside {
        return Err(SecurityViolation::OutsideRoot {
            path: candidate,
            root: output_root.to_path_buf(),
        });
    }

    // A symlinked subdirectory inside the root could still redirect the write.
    if let (Some(parent), Ok(root)) = (candidate.parent(), fs::canonicalize(output_root)) {
        if let Ok(parent) = fs::canonicalize(parent) {
            if !parent.starts_with(&root) {
                return Err(SecurityViolation::OutsideRoot {
                    path: candidate,
                    root,
                });
            }
        }
    }

    Ok(candidate)
}

/// Validates an input path against the symlink policy.
///
/// Without `follow_symlinks`, the path itself and every directory between
/// `root` and the path must not be symbolic links. With it, links are allowed
/// as long as the fully resolved path stays under the resolved `root`; a link
/// that cannot be resolved (dangling or looping) is refused as well.
///
/// A path that does not exist is not a violation; reading it reports that.
///
/// # Errors
///
/// Returns [`SecurityViolation::SymlinkNotAllowed`] or
/// [`SecurityViolation::SymlinkEscape`] (or [`SecurityViolation::OutsideRoot`]
/// for a non-link path that resolves elsewhere).
pub fn validate_input_entry(
    root: &Path,
    path: &Path,
    follow_symlinks: bool,
) -> Result<(), SecurityViolation> {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return Ok(());
    };
    let is_link = metadata.file_type().is_symlink();

    if !follow_symlinks {
        if is_link {
            return Err(SecurityViolation::SymlinkNotAllowed {
                path: path.to_path_buf(),
            });
        }
        if let Some(link) = linked_ancestor(root, path) {
            return Err(SecurityViolation::SymlinkNotAllowed { path: link });
        }
    }

    let root = fs::canonicalize(root).map_err(|_| SecurityViolation::InvalidPath {
        path: root.display().to_string(),
    })?;

    let resolved = match fs::canonicalize(path) {
        Ok(resolved) => resolved,
        Err(e) if is_link => {
            return Err(SecurityViolation::SymlinkEscape {
                path: path.to_path_buf(),
                reason: e.to_string(),
            });
        }
        Err(_) => return Ok(()),
    };

    if resolved.starts_with(&root) {
        return Ok(());
    }

    if follow_symlinks {
        Err(SecurityViolation::SymlinkEscape {
            path: path.to_path_buf(),
            reason: format!("resolves to {}", resolved.display()),
        })
    } else {
        Err(SecurityViolation::OutsideRoot {
            path: resolved,
            root,
        })
    }
}

/// Returns the first directory between `root` and `path` that is a symlink.
fn linked_ancestor(root: &Path, path: &Path) -> Option<PathBuf> {
    let relative = path.strip_prefix(root).ok()?;
    let mut current = root.to_path_buf();
    let mut components = relative.components().peekable();

    while let Some(component) = components.next() {
        current.push(component);
        if components.peek().is_none() {
            break;
        }
        let is_link = fs::symlink_metadata(&current)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if is_link {
            return Some(current);
        }
    }
    None
}

fn is_absolute_form(unified: &str) -> bool {
    let bytes = unified.as_bytes();
    unified.starts_with('/')
        || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}

/// Decodes `%2e`, `%2f`, `%5c` and `%25` until nothing changes, so double
/// encoding is unwrapped too.
fn decode_escapes(raw: &str) -> Cow<'_, str> {
    let mut current = Cow::Borrowed(raw);
    loop {
        let next = decode_once(&current);
        if next == current.as_ref() {
            return current;
        }
        current = Cow::Owned(next);
    }
}

fn decode_once(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let decoded = tail
            .get(1..3)
            .and_then(|hex| match hex.to_ascii_lowercase().as_str() {
                "2e" => Some('.'),
                "2f" => Some('/'),
                "5c" => Some('\\'),
                "25" => Some('%'),
                _ => None,
            });
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[3..];
            }
            None => {
                out.push('%');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_plain_paths() {
        assert_eq!(normalize_relative("src/main.rs").unwrap(), "src/main.rs");
        assert_eq!(normalize_relative("./src//lib.rs").unwrap(), "src/lib.rs");
        assert_eq!(normalize_relative("src\\win\\mod.rs").unwrap(), "src/win/mod.rs");
        assert_eq!(normalize_relative("100%25.txt").unwrap(), "100%25.txt");
    }

    #[test]
    fn test_normalize_rejects_traversal() {
        assert!(matches!(
            normalize_relative("../etc/passwd"),
            Err(SecurityViolation::PathTraversal { .. })
        ));
        assert!(matches!(
            normalize_relative("a/../../b"),
            Err(SecurityViolation::PathTraversal { .. })
        ));
        assert!(matches!(
            normalize_relative("a\\..\\b"),
            Err(SecurityViolation::PathTraversal { .. })
        ));
    }

    #[test]
    fn test_normalize_rejects_encoded_traversal() {
        for raw in ["..%2fetc", "%2e%2e/secret", "a/%2E%2E%5Cb", "%252e%252e%252fx"] {
            assert!(
                matches!(
                    normalize_relative(raw),
                    Err(SecurityViolation::EncodedTraversal { .. })
                ),
                "{raw} should be rejected as encoded traversal"
            );
        }
    }

    #[test]
    fn test_normalize_rejects_absolute_forms() {
        for raw in ["/etc/passwd", "\\\\server\\share", "C:\\Windows", "c:/x", "%2fetc"] {
            assert!(
                matches!(
                    normalize_relative(raw),
                    Err(SecurityViolation::AbsolutePath { .. })
                ),
                "{raw} should be rejected as absolute"
            );
        }
    }

    #[test]
    fn test_normalize_rejects_empty_and_nul() {
        assert!(normalize_relative("").is_err());
        assert!(normalize_relative("./.").is_err());
        assert!(normalize_relative("a\0b").is_err());
    }

    #[test]
    fn test_validate_output_path_joins_under_root() {
        let temp = assert_fs::TempDir::new().unwrap();
        let path = validate_output_path(temp.path(), "src_main.rs").unwrap();
        assert_eq!(path, temp.path().join("src_main.rs"));

        assert!(validate_output_path(temp.path(), "../escape.txt").is_err());
        assert!(validate_output_path(temp.path(), "/tmp/escape.txt").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_output_path_rejects_symlinked_subdirectory() {
        let temp = assert_fs::TempDir::new().unwrap();
        let outside = assert_fs::TempDir::new().unwrap();
        let out = temp.child("out");
        out.create_dir_all().unwrap();
        std::os::unix::fs::symlink(outside.path(), out.path().join("link")).unwrap();

        let result = validate_output_path(out.path(), "link/file.txt");
        assert!(matches!(result, Err(SecurityViolation::OutsideRoot { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_input_symlink_refused_when_not_following() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("real.txt").write_str("data").unwrap();
        let link = temp.path().join("link.txt");
        std::os::unix::fs::symlink(temp.path().join("real.txt"), &link).unwrap();

        let result = validate_input_entry(temp.path(), &link, false);
        assert!(matches!(result, Err(SecurityViolation::SymlinkNotAllowed { .. })));
        assert!(validate_input_entry(temp.path(), &link, true).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_input_symlink_escape_detected_when_following() {
        let temp = assert_fs::TempDir::new().unwrap();
        let outside = assert_fs::TempDir::new().unwrap();
        outside.child("secret.txt").write_str("secret").unwrap();
        let link = temp.path().join("leak.txt");
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), &link).unwrap();

        let result = validate_input_entry(temp.path(), &link, true);
        assert!(matches!(result, Err(SecurityViolation::SymlinkEscape { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_input_symlink_loop_detected() {
        let temp = assert_fs::TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        std::os::unix::fs::symlink(&b, &a).unwrap();
        std::os::unix::fs::symlink(&a, &b).unwrap();

        let result = validate_input_entry(temp.path(), &a, true);
        assert!(matches!(result, Err(SecurityViolation::SymlinkEscape { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_input_under_symlinked_directory_refused_when_not_following() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("real/file.txt").write_str("x").unwrap();
        std::os::unix::fs::symlink(temp.path().join("real"), temp.path().join("alias")).unwrap();

        let path = temp.path().join("alias/file.txt");
        let result = validate_input_entry(temp.path(), &path, false);
        assert!(matches!(result, Err(SecurityViolation::SymlinkNotAllowed { .. })));
        assert!(validate_input_entry(temp.path(), &path, true).is_ok());
    }

    #[test]
    fn test_missing_input_is_not_a_violation() {
        let temp = assert_fs::TempDir::new().unwrap();
        let path = temp.path().join("does-not-exist.txt");
        assert!(validate_input_entry(temp.path(), &path, false).is_ok());
    }

    proptest! {
        #[test]
        fn validated_output_never_escapes(raw in r"[a-z.%25eEfFcC/\\:]{0,24}") {
            let root = Path::new("/srv/out");
            if let Ok(path) = validate_output_path(root, &raw) {
                prop_assert!(path.starts_with(root));
                let rest = path.strip_prefix(root).unwrap();
                prop_assert!(rest.components().all(|c| matches!(c, Component::Normal(_))));
            }
        }

        #[test]
        fn dot_dot_segments_always_rejected(
            prefix in r"[a-z]{0,6}(/[a-z]{1,6}){0,3}",
            suffix in r"[a-z]{0,6}",
            sep in prop::sample::select(vec!["/", "\\", "%2f", "%2F", "%5c"]),
            dots in prop::sample::select(vec!["..", "%2e%2e", "%2E.", ".%2e", "%252e%252e"]),
        ) {
            let raw = if prefix.is_empty() {
                format!("{dots}{sep}{suffix}")
            } else {
                format!("{prefix}{sep}{dots}{sep}{suffix}")
            };
            prop_assert!(normalize_relative(&raw).is_err(), "{} was accepted", raw);
        }

        #[test]
        fn normalized_paths_are_clean(raw in r"[a-z]{1,5}([/\\][a-z.]{1,5}){0,4}") {
            if let Ok(normalized) = normalize_relative(&raw) {
                prop_assert!(!normalized.starts_with('/'));
                prop_assert!(!normalized.contains('\\'));
                prop_assert!(normalized.split('/').all(|s| !s.is_empty() && s != "." && s != ".."));
            }
        }
    }
}
