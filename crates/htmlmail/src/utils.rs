use std::{
    fs::File,
    path::{Path, PathBuf},
};

/// Whether `reference` starts with a URL scheme such as `https:`, `cid:` or `data:`.
/// Single letters are not schemes, so Windows drive paths stay local.
#[must_use]
pub(crate) fn has_url_scheme(reference: &str) -> bool {
    let Some((scheme, _)) = reference.split_once(':') else {
        return false;
    };
    let mut chars = scheme.chars();
    scheme.len() > 1
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// Whether `reference` points somewhere other than the local filesystem.
#[must_use]
pub(crate) fn is_remote(reference: &str) -> bool {
    has_url_scheme(reference) || reference.starts_with("//")
}

/// Resolve a markup or stylesheet reference to a readable local file.
///
/// Relative references are joined to `base_dir` when one is given. Returns `None` for
/// URLs, missing files, directories and files that can't be opened.
pub(crate) fn resolve_local_path(reference: &str, base_dir: Option<&Path>) -> Option<PathBuf> {
    let reference = reference.trim();
    if reference.is_empty() || is_remote(reference) {
        return None;
    }
    let path = Path::new(reference);
    let path = match base_dir {
        Some(base_dir) if path.is_relative() => base_dir.join(path),
        _ => path.to_path_buf(),
    };
    (path.is_file() && File::open(&path).is_ok()).then_some(path)
}

/// Final component of `path`, if any.
#[must_use]
pub(crate) fn base_name(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}

/// Content type guessed from a file name.
#[must_use]
pub(crate) fn guess_content_type(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
