//! Template rendering: turns a template slug plus data into HTML.

use std::collections::HashMap;
use std::path::Path;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::error::RenderError;

/// Renders a named template with job data.
pub trait Renderer: Send + Sync {
    fn render(&self, slug: &str, data: &Map<String, Value>) -> Result<String, RenderError>;
}

/// Fills `{{ key }}` placeholders in the `*.html` templates of one directory.
///
/// Every template is read once by [`load`](Self::load); `render` never touches
/// the filesystem, so it is safe to call from async workers. `<dir>/<slug>.html`
/// is served for `slug`.
///
/// Dotted keys (`{{ user.name }}`) walk nested objects. String values are
/// HTML-escaped; other values are inserted as JSON text. Missing keys render
/// as nothing.
#[derive(Debug, Clone)]
pub struct TemplateDirRenderer {
    templates: HashMap<String, String>,
    placeholder: Regex,
}

impl TemplateDirRenderer {
    /// Read every `*.html` file directly inside `dir`.
    pub fn load(dir: &Path) -> std::io::Result<Self> {
        let mut templates = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("html") {
                continue;
            }
            let Some(slug) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            templates.insert(slug.to_string(), std::fs::read_to_string(&path)?);
        }

        tracing::debug!(dir = %dir.display(), count = templates.len(), "Templates loaded");
        Ok(Self {
            templates,
            placeholder: Regex::new(r"\{\{\s*([A-Za-z0-9_][A-Za-z0-9_.\-]*)\s*\}\}")
                .expect("placeholder pattern is valid"),
        })
    }

    /// Loaded templates as `(slug, source)`.
    pub fn templates(&self) -> impl Iterator<Item = (&str, &str)> {
        self.templates
            .iter()
            .map(|(slug, source)| (slug.as_str(), source.as_str()))
    }
}

fn check_slug(slug: &str) -> Result<(), RenderError> {
    let invalid = slug.is_empty()
        || slug.contains("..")
        || slug.contains('/')
        || slug.contains('\\')
        || slug.contains('\0');
    if invalid {
        return Err(RenderError::InvalidSlug {
            slug: slug.to_string(),
        });
    }
    Ok(())
}

impl Renderer for TemplateDirRenderer {
    fn render(&self, slug: &str, data: &Map<String, Value>) -> Result<String, RenderError> {
        check_slug(slug)?;
        let template = self
            .templates
            .get(slug)
            .ok_or_else(|| RenderError::NotFound {
                slug: slug.to_string(),
            })?;

        let html = self
            .placeholder
            .replace_all(template, |caps: &Captures<'_>| {
                lookup(data, &caps[1]).map(render_value).unwrap_or_default()
            });
        Ok(html.into_owned())
    }
}

fn lookup<'a>(data: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    if let Some(value) = data.get(key) {
        return Some(value);
    }
    let mut parts = key.split('.');
    let mut current = data.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => escape_html(s),
        other => escape_html(&other.to_string()),
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn renderer_with(slug: &str, body: &str) -> (tempfile::TempDir, TemplateDirRenderer) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(format!("{slug}.html")), body).unwrap();
        let renderer = TemplateDirRenderer::load(dir.path()).unwrap();
        (dir, renderer)
    }

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn fills_placeholders() {
        let (_dir, r) = renderer_with("welcome", "<p>Hi {{name}}, you have {{ count }} messages</p>");
        let html = r
            .render("welcome", &data(json!({"name": "Ada", "count": 3})))
            .unwrap();
        assert_eq!(html, "<p>Hi Ada, you have 3 messages</p>");
    }

    #[test]
    fn escapes_strings_and_blanks_missing() {
        let (_dir, r) = renderer_with("t", "[{{ a }}][{{ missing }}][{{ n }}]");
        let html = r
            .render("t", &data(json!({"a": "<b>&</b>", "n": null})))
            .unwrap();
        assert_eq!(html, "[&lt;b&gt;&amp;&lt;/b&gt;][][]");
    }

    #[test]
    fn dotted_keys_walk_objects() {
        let (_dir, r) = renderer_with("t", "{{ user.name }}");
        let html = r
            .render("t", &data(json!({"user": {"name": "Grace"}})))
            .unwrap();
        assert_eq!(html, "Grace");
    }

    #[test]
    fn missing_template_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let r = TemplateDirRenderer::load(dir.path()).unwrap();
        let err = r.render("nope", &Map::new()).unwrap_err();
        assert!(matches!(err, RenderError::NotFound { .. }));
    }

    #[test]
    fn templates_are_read_once_at_load() {
        let (dir, r) = renderer_with("welcome", "<p>v1</p>");
        std::fs::write(dir.path().join("notes.txt"), "not a template").unwrap();
        std::fs::write(dir.path().join("welcome.html"), "<p>v2</p>").unwrap();
        std::fs::remove_file(dir.path().join("welcome.html")).unwrap();

        assert_eq!(r.render("welcome", &Map::new()).unwrap(), "<p>v1</p>");
        let slugs: Vec<_> = r.templates().map(|(slug, _)| slug).collect();
        assert_eq!(slugs, vec!["welcome"]);
    }

    #[test]
    fn missing_directory_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TemplateDirRenderer::load(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn path_traversal_is_rejected() {
        let (_dir, r) = renderer_with("secret", "<p>hidden</p>");
        for slug in ["../secret", "a/b", "", "..", "a\\b"] {
            let err = r.render(slug, &Map::new()).unwrap_err();
            assert!(matches!(err, RenderError::InvalidSlug { .. }), "slug {slug:?}");
        }
    }
}
