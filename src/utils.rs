//! Small helpers shared across `engine` modules that don't deserve their own
//! file (spec.md GLOSSARY: excluded dotfiles; pluralized tallies).

use std::path::Path;

/// True if a `.git/annex` directory sits alongside `toplevel` (spec.md
/// GLOSSARY: annex sibling). REFRESH is refused in this case.
pub fn is_annex_sibling(toplevel: &Path) -> bool {
    toplevel.join(".git").join("annex").is_dir()
}

/// Named entries of the excluded-dotfile set (spec.md GLOSSARY). Any path
/// component starting with `.` is excluded too — see
/// [`is_excluded_dotfile_path`].
pub const EXCLUDED_DOTFILE_NAMES: [&str; 5] =
    [".git", ".dandi", ".datalad", ".gitattributes", ".gitmodules"];

/// True if `relative_path` (forward-slash, relative to a Zarr root) should be
/// preserved untouched during tree reconciliation (spec.md §4.5).
pub fn is_excluded_dotfile_path(relative_path: &str) -> bool {
    relative_path.split('/').any(|component| {
        component.starts_with('.')
            || EXCLUDED_DOTFILE_NAMES.contains(&component)
    })
}

/// `"1 file"` / `"3 files"`.
pub fn pluralize(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("1 {noun}")
    } else {
        format!("{count} {noun}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotfile_exclusion_matches_named_and_leading_dot_components() {
        assert!(is_excluded_dotfile_path(".git"));
        assert!(is_excluded_dotfile_path(".git/objects/abc"));
        assert!(is_excluded_dotfile_path("arr_0/.zattrs"));
        assert!(!is_excluded_dotfile_path("arr_0/0.0"));
    }

    #[test]
    fn pluralize_handles_singular_and_plural() {
        assert_eq!(pluralize(1, "file"), "1 file");
        assert_eq!(pluralize(0, "file"), "0 files");
        assert_eq!(pluralize(2, "file"), "2 files");
    }

    #[test]
    fn annex_sibling_detected_by_dot_git_annex_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_annex_sibling(dir.path()));
        std::fs::create_dir_all(dir.path().join(".git").join("annex")).unwrap();
        assert!(is_annex_sibling(dir.path()));
    }
}
