//! Rewriting of HTML bodies into self-contained markup.
//!
//! Linked stylesheets are inlined into `<style>` blocks and local `src` references
//! are replaced by `cid:` references to embedded resources. Anything that can't be
//! resolved locally is left exactly as written.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::{Captures, Regex};
use tracing::{debug, warn};

use crate::{
    stylesheet::StylesheetInliner,
    utils::{base_name, guess_content_type, is_remote, resolve_local_path},
};

// Quoted attribute values may contain `>`.
static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<link\b(?:[^>"']|"[^"]*"|'[^']*')*>"#)
        .expect("LINK_RE: hardcoded regex is valid")
});

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b([a-z][a-z0-9_:-]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("ATTR_RE: hardcoded regex is valid")
});

// Any opening tag: <img>, <video>, <source>, <embed> and friends.
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<[a-z][a-z0-9-]*\b(?:[^>"']|"[^"]*"|'[^']*')*>"#)
        .expect("TAG_RE: hardcoded regex is valid")
});

/// Content identifier for a `src` reference. Derived from the reference text only,
/// so every occurrence of the same path maps to the same identifier.
#[must_use]
pub fn content_id(reference: &str) -> String {
    sha256::digest(reference)
}

/// Local file embedded into a message and referenced as `cid:<content_id>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmbeddedResource {
    content_id: String,
    source_path: PathBuf,
    display_name: String,
    content_type: String,
    content: Vec<u8>,
}

impl EmbeddedResource {
    #[must_use]
    pub fn new(content_id: String, source_path: PathBuf, content: Vec<u8>) -> Self {
        let display_name = base_name(&source_path).unwrap_or_else(|| content_id.clone());
        let content_type = guess_content_type(&display_name);
        Self {
            content_id,
            source_path,
            display_name,
            content_type,
            content,
        }
    }

    /// Getter for `content_id`.
    #[must_use]
    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    /// Getter for `source_path`.
    #[must_use]
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Getter for `display_name`.
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Getter for `content_type`.
    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Getter for `content`.
    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub(crate) fn into_parts(self) -> (String, String, Vec<u8>) {
        (self.content_id, self.content_type, self.content)
    }
}

/// Receives resources discovered while rewriting a body.
pub trait ResourceSink {
    fn register(&mut self, resource: EmbeddedResource);
}

impl<F> ResourceSink for F
where
    F: FnMut(EmbeddedResource),
{
    fn register(&mut self, resource: EmbeddedResource) {
        self(resource);
    }
}

/// What a single rewrite did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RewriteReport {
    pub stylesheets_inlined: usize,
    pub resources_embedded: usize,
    /// Local references that could not be read and were left unchanged.
    pub skipped: usize,
}

#[derive(Clone, Debug, Default)]
pub struct BodyRewriter {
    base_dir: Option<PathBuf>,
    inliner: StylesheetInliner,
}

impl BodyRewriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory relative `href` and `src` references are resolved against.
    #[must_use]
    pub fn with_base_dir<P>(mut self, base_dir: P) -> Self
    where
        P: Into<PathBuf>,
    {
        let base_dir = base_dir.into();
        self.inliner = self.inliner.with_base_dir(base_dir.clone());
        self.base_dir = Some(base_dir);
        self
    }

    #[must_use]
    pub fn with_inliner(mut self, inliner: StylesheetInliner) -> Self {
        self.inliner = inliner;
        self
    }

    /// Rewrite `html`, reporting every embedded resource to `sink` once.
    #[must_use]
    pub fn rewrite(&self, html: &str, sink: &mut dyn ResourceSink) -> String {
        self.rewrite_with_report(html, sink).0
    }

    pub fn rewrite_with_report(
        &self,
        html: &str,
        sink: &mut dyn ResourceSink,
    ) -> (String, RewriteReport) {
        let mut report = RewriteReport::default();
        // Stylesheets first, so the replaced <link> fragments are never scanned for `src`.
        let html = self.inline_stylesheets(html, &mut report);
        let html = self.embed_sources(&html, sink, &mut report);
        debug!(
            "Rewrote body: {} stylesheet(s) inlined, {} resource(s) embedded, {} skipped",
            report.stylesheets_inlined, report.resources_embedded, report.skipped
        );
        (html, report)
    }

    fn inline_stylesheets(&self, html: &str, report: &mut RewriteReport) -> String {
        LINK_RE
            .replace_all(html, |caps: &Captures| {
                let tag = &caps[0];
                let attrs = parse_attributes(tag);
                let is_stylesheet = attr(&attrs, "rel").is_some_and(|rel| {
                    rel.split_whitespace()
                        .any(|token| token.eq_ignore_ascii_case("stylesheet"))
                });
                let Some(href) = attr(&attrs, "href").filter(|_| is_stylesheet) else {
                    return tag.to_string();
                };
                let css = resolve_local_path(href, self.base_dir.as_deref())
                    .and_then(|path| self.inliner.inline_file(&path));
                match css {
                    Some(css) => {
                        report.stylesheets_inlined += 1;
                        match attr(&attrs, "media") {
                            Some(media) => format!("<style media=\"{media}\">\n{css}\n</style>"),
                            None => format!("<style>\n{css}\n</style>"),
                        }
                    }
                    None => {
                        if !is_remote(href) {
                            warn!("Stylesheet {href} not found, leaving <link> unchanged");
                            report.skipped += 1;
                        }
                        tag.to_string()
                    }
                }
            })
            .into_owned()
    }

    fn embed_sources(
        &self,
        html: &str,
        sink: &mut dyn ResourceSink,
        report: &mut RewriteReport,
    ) -> String {
        let mut registered = HashSet::new();
        TAG_RE
            .replace_all(html, |caps: &Captures| {
                let tag = &caps[0];
                let mut output = String::with_capacity(tag.len());
                let mut last = 0;
                // Attributes are matched in sequence, so text inside a quoted value is
                // never taken for an attribute name.
                for attr_caps in ATTR_RE.captures_iter(tag) {
                    if !attr_caps[1].eq_ignore_ascii_case("src") {
                        continue;
                    }
                    let Some(value) = attr_caps.iter().skip(2).flatten().next() else {
                        continue;
                    };
                    if let Some(id) =
                        self.embed_source(value.as_str(), sink, &mut registered, report)
                    {
                        output.push_str(&tag[last..value.start()]);
                        output.push_str("cid:");
                        output.push_str(&id);
                        last = value.end();
                    }
                }
                output.push_str(&tag[last..]);
                output
            })
            .into_owned()
    }

    /// Register the local file behind `value` and return its content id, or `None`
    /// when the reference has to stay as written.
    fn embed_source(
        &self,
        value: &str,
        sink: &mut dyn ResourceSink,
        registered: &mut HashSet<String>,
        report: &mut RewriteReport,
    ) -> Option<String> {
        if is_remote(value.trim()) || value.trim().is_empty() {
            return None;
        }
        let Some(path) = resolve_local_path(value, self.base_dir.as_deref()) else {
            warn!("Resource {value} not found, leaving reference unchanged");
            report.skipped += 1;
            return None;
        };
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(err) => {
                warn!("Failed to read {value}, leaving reference unchanged: {err}");
                report.skipped += 1;
                return None;
            }
        };
        let id = content_id(value);
        if registered.insert(id.clone()) {
            debug!("Embedding {} as cid:{id}", path.display());
            sink.register(EmbeddedResource::new(id.clone(), path, content));
            report.resources_embedded += 1;
        }
        Some(id)
    }
}

fn parse_attributes(tag: &str) -> Vec<(String, String)> {
    ATTR_RE
        .captures_iter(tag)
        .map(|caps| {
            let value = caps
                .iter()
                .skip(2)
                .flatten()
                .next()
                .map_or("", |m| m.as_str());
            (caps[1].to_ascii_lowercase(), value.to_string())
        })
        .collect()
}

fn attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("local.png"), b"0123456789").unwrap();
        fs::write(dir.path().join("style.css"), "@import url(reset.css);\nbody { color: #333; }")
            .unwrap();
        fs::write(dir.path().join("reset.css"), "* { margin: 0; }").unwrap();
        dir
    }

    fn collect(rewriter: &BodyRewriter, html: &str) -> (String, Vec<EmbeddedResource>) {
        let mut resources = Vec::new();
        let output = rewriter.rewrite(html, &mut |resource: EmbeddedResource| {
            resources.push(resource);
        });
        (output, resources)
    }

    #[test]
    fn test_local_stylesheet_is_inlined() {
        let dir = fixture();
        let rewriter = BodyRewriter::new().with_base_dir(dir.path());
        let (output, _) = collect(
            &rewriter,
            r#"<head><link rel="stylesheet" href="style.css"></head><p>x</p>"#,
        );
        assert_eq!(
            output,
            "<head><style>\n* { margin: 0; }\nbody { color: #333; }\n</style></head><p>x</p>"
        );
    }

    #[test]
    fn test_stylesheet_media_and_attribute_order() {
        let dir = fixture();
        let rewriter = BodyRewriter::new().with_base_dir(dir.path());
        let (output, _) = collect(
            &rewriter,
            r#"<LINK href='reset.css' media="print" REL="Stylesheet" />"#,
        );
        assert_eq!(output, "<style media=\"print\">\n* { margin: 0; }\n</style>");
    }

    #[test]
    fn test_missing_stylesheet_is_left_unchanged() {
        let dir = fixture();
        let rewriter = BodyRewriter::new().with_base_dir(dir.path());
        let html = r#"<link rel="stylesheet" href="missing.css"><link rel="icon" href="style.css">"#;
        let mut calls = 0;
        let (output, report) =
            rewriter.rewrite_with_report(html, &mut |_: EmbeddedResource| calls += 1);
        assert_eq!(output, html);
        assert_eq!(calls, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.stylesheets_inlined, 0);
    }

    #[test]
    fn test_local_image_is_embedded() {
        let dir = fixture();
        let rewriter = BodyRewriter::new().with_base_dir(dir.path());
        let (output, resources) = collect(
            &rewriter,
            r#"<img alt="logo" src="local.png" width="10"><img src='local.png'>"#,
        );

        let id = content_id("local.png");
        assert_eq!(
            output,
            format!(r#"<img alt="logo" src="cid:{id}" width="10"><img src='cid:{id}'>"#)
        );
        assert_eq!(resources.len(), 1);
        let resource = &resources[0];
        assert_eq!(resource.content_id(), id);
        assert_eq!(resource.source_path(), dir.path().join("local.png"));
        assert_eq!(resource.display_name(), "local.png");
        assert_eq!(resource.content_type(), "image/png");
        assert_eq!(resource.content(), b"0123456789");
    }

    #[test]
    fn test_content_id_is_deterministic() {
        assert_eq!(content_id("local.png"), content_id("local.png"));
        assert_ne!(content_id("local.png"), content_id("other.png"));
        assert_eq!(content_id("local.png").len(), 64);
    }

    #[test]
    fn test_src_on_any_tag() {
        let dir = fixture();
        let rewriter = BodyRewriter::new().with_base_dir(dir.path());
        let (output, resources) = collect(
            &rewriter,
            r#"<video controls
                src="local.png"></video><div data-src="local.png"></div>"#,
        );
        assert!(output.contains(&format!("src=\"cid:{}\"", content_id("local.png"))));
        assert!(output.contains(r#"data-src="local.png""#));
        assert_eq!(resources.len(), 1);
    }

    #[test]
    fn test_gt_inside_quoted_attribute() {
        let dir = fixture();
        let rewriter = BodyRewriter::new().with_base_dir(dir.path());
        let (output, resources) = collect(&rewriter, r#"<img alt="a > b" src="local.png">"#);
        assert_eq!(
            output,
            format!(r#"<img alt="a > b" src="cid:{}">"#, content_id("local.png"))
        );
        assert_eq!(resources.len(), 1);

        let (output, _) = collect(
            &rewriter,
            r#"<link title="a > b" rel="stylesheet" href="reset.css">"#,
        );
        assert_eq!(output, "<style>\n* { margin: 0; }\n</style>");
    }

    #[test]
    fn test_src_text_inside_other_attribute_is_ignored() {
        let dir = fixture();
        let rewriter = BodyRewriter::new().with_base_dir(dir.path());
        let html = r#"<img title='x src="local.png"' src="https://example.com/r.png">"#;
        let (output, resources) = collect(&rewriter, html);
        assert_eq!(output, html);
        assert!(resources.is_empty());

        let (output, resources) = collect(&rewriter, r#"<img title='src="x"' src=local.png>"#);
        assert_eq!(
            output,
            format!(r#"<img title='src="x"' src=cid:{}>"#, content_id("local.png"))
        );
        assert_eq!(resources.len(), 1);
    }

    #[test]
    fn test_remote_and_missing_sources_are_left_unchanged() {
        let dir = fixture();
        let rewriter = BodyRewriter::new().with_base_dir(dir.path());
        let html = concat!(
            r#"<img src="https://example.com/a.png">"#,
            r#"<img src="//cdn.example.com/b.png">"#,
            r#"<img src="data:image/png;base64,AAAA">"#,
            r#"<img src="missing.png">"#,
            r#"<img src="">"#,
        );
        let mut calls = 0;
        let (output, report) =
            rewriter.rewrite_with_report(html, &mut |_: EmbeddedResource| calls += 1);
        assert_eq!(output, html);
        assert_eq!(calls, 0);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let dir = fixture();
        let rewriter = BodyRewriter::new().with_base_dir(dir.path());
        let html = r#"<html><head><link rel="stylesheet" href="style.css"></head>
<body><p>Hi</p><img src="local.png"><img src="https://example.com/x.png"></body></html>"#;

        let (first, resources) = collect(&rewriter, html);
        assert_eq!(resources.len(), 1);

        let mut calls = 0;
        let second = rewriter.rewrite(&first, &mut |_: EmbeddedResource| calls += 1);
        assert_eq!(second, first);
        assert_eq!(calls, 0);
    }
}
