//! Object path helpers.
//!
//! Child objects are addressed relative to their parent: `"b/c"` below
//! `"/a"` is `"/a/b/c"`. Absolute paths are accepted too as long as they lie
//! strictly below the parent.

use zvariant::ObjectPath;

/// Prefix shared by the paths of every descendant of `parent`.
pub(crate) fn child_prefix(parent: &str) -> String {
    if parent == "/" {
        "/".to_string()
    } else {
        format!("{parent}/")
    }
}

/// Returns `path` as a valid absolute path below `parent`, or `None`.
pub(crate) fn resolve_child_path(parent: &str, path: &str) -> Option<String> {
    let prefix = child_prefix(parent);
    let absolute = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{prefix}{path}")
    };
    if absolute.len() <= prefix.len() || !absolute.starts_with(&prefix) {
        return None;
    }
    ObjectPath::try_from(absolute.as_str()).ok()?;
    Some(absolute)
}

/// Splits the part of `child` below `parent` into its segments.
///
/// `child` must come from [`resolve_child_path`] for the same parent.
pub(crate) fn relative_segments<'a>(parent: &str, child: &'a str) -> Vec<&'a str> {
    child[child_prefix(parent).len()..].split('/').collect()
}

/// Path of the child `segment` directly below `parent`.
pub(crate) fn join_segment(parent: &str, segment: &str) -> String {
    format!("{}{segment}", child_prefix(parent))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_paths() {
        assert_eq!(resolve_child_path("/a", "b/c").as_deref(), Some("/a/b/c"));
        assert_eq!(resolve_child_path("/", "b").as_deref(), Some("/b"));
    }

    #[test]
    fn test_absolute_paths() {
        assert_eq!(resolve_child_path("/a", "/a/b").as_deref(), Some("/a/b"));
        assert_eq!(resolve_child_path("/", "/x/y").as_deref(), Some("/x/y"));
    }

    #[test]
    fn test_rejected_paths() {
        // Not below the parent.
        assert_eq!(resolve_child_path("/a", "/ab/c"), None);
        assert_eq!(resolve_child_path("/a", "/a"), None);
        assert_eq!(resolve_child_path("/a", "/b/c"), None);
        // Trailing slash and empty segments.
        assert_eq!(resolve_child_path("/a", "b/"), None);
        assert_eq!(resolve_child_path("/a", "b//c"), None);
        assert_eq!(resolve_child_path("/a", ""), None);
        // Characters not allowed in object paths.
        assert_eq!(resolve_child_path("/a", "b-c"), None);
    }

    #[test]
    fn test_segments() {
        assert_eq!(relative_segments("/a", "/a/b/c"), vec!["b", "c"]);
        assert_eq!(relative_segments("/", "/x"), vec!["x"]);
        assert_eq!(join_segment("/", "x"), "/x");
        assert_eq!(join_segment("/a/b", "c"), "/a/b/c");
    }
}
