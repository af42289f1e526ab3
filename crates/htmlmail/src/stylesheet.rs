//! Flattening of `@import url(...)` chains into a single stylesheet.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::{Captures, Regex};
use tracing::{debug, warn};

use crate::utils::resolve_local_path;

/// Nesting limit for `@import`; imports past it are left unresolved.
pub const MAX_IMPORT_DEPTH: usize = 20;

static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)@import\s+url\(\s*(?:"([^"]*)"|'([^']*)'|([^)'"\s]*))\s*\)\s*;"#)
        .expect("IMPORT_RE: hardcoded regex is valid")
});

#[derive(Clone, Debug)]
pub struct StylesheetInliner {
    base_dir: Option<PathBuf>,
    max_depth: usize,
}

impl Default for StylesheetInliner {
    fn default() -> Self {
        Self::new()
    }
}

impl StylesheetInliner {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base_dir: None,
            max_depth: MAX_IMPORT_DEPTH,
        }
    }

    /// Directory relative import paths are resolved against.
    #[must_use]
    pub fn with_base_dir<P>(mut self, base_dir: P) -> Self
    where
        P: Into<PathBuf>,
    {
        self.base_dir = Some(base_dir.into());
        self
    }

    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Replace every `@import url(<path>);` pointing to a readable local file with
    /// that file's (recursively inlined) contents. Anything else is left as is.
    #[must_use]
    pub fn inline(&self, css: &str) -> String {
        self.inline_at(css, self.base_dir.as_deref(), &mut Vec::new())
    }

    /// Inline the stylesheet stored at `path`. Returns `None` if it can't be read.
    #[must_use]
    pub fn inline_file(&self, path: &Path) -> Option<String> {
        self.read_and_inline(path, &mut Vec::new())
    }

    /// `chain` holds the canonical paths of the stylesheets currently being inlined,
    /// outermost first.
    fn read_and_inline(&self, path: &Path, chain: &mut Vec<PathBuf>) -> Option<String> {
        match fs::read_to_string(path) {
            Ok(css) => {
                chain.push(canonical(path));
                let css = self.inline_at(&css, path.parent(), chain);
                chain.pop();
                Some(css)
            }
            Err(err) => {
                warn!("Failed to read stylesheet {}: {err}", path.display());
                None
            }
        }
    }

    fn inline_at(&self, css: &str, dir: Option<&Path>, chain: &mut Vec<PathBuf>) -> String {
        IMPORT_RE
            .replace_all(css, |caps: &Captures| {
                let original = caps[0].to_string();
                let Some(target) = caps.iter().skip(1).flatten().next().map(|m| m.as_str())
                else {
                    return original;
                };
                if chain.len() >= self.max_depth {
                    warn!("Import depth limit reached, leaving @import of {target} unresolved");
                    return original;
                }
                let Some(path) = resolve_local_path(target, dir) else {
                    debug!("Leaving @import of {target} unresolved");
                    return original;
                };
                if chain.contains(&canonical(&path)) {
                    warn!("Cyclic @import of {target}, leaving it unresolved");
                    return original;
                }
                self.read_and_inline(&path, chain).unwrap_or(original)
            })
            .into_owned()
    }
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
