//! View sources: named templates composed with layouts.
//!
//! Templates use `<%= @key %>` for assigns (dotted paths reach into nested
//! objects), `<%= @connected %>` for the connection flag and `<%= yield %>`
//! in layouts for the wrapped content.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde_json::Value as JsonValue;

use crate::error::LiveError;
use crate::live::context::LiveContext;
use crate::live::render::RenderContext;

/// Supplies named, layout-composed templates.
pub trait ViewSource: Send + Sync {
    fn render(&self, name: &str, rc: &RenderContext<'_>, layouts: &[String]) -> Result<String, LiveError>;
}

/// Build a render function that renders `name` through the view source found
/// on the handler context.
pub fn with_views_renderer(
    name: &str,
    layouts: &[&str],
) -> impl Fn(&LiveContext<'_>, &RenderContext<'_>) -> Result<String, LiveError> + Send + Sync + 'static {
    let name = name.to_string();
    let layouts: Vec<String> = layouts.iter().map(|l| l.to_string()).collect();
    move |ctx, rc| {
        let views = ctx
            .views()
            .ok_or_else(|| LiveError::render("no view source available"))?;
        views.render(&name, rc, &layouts)
    }
}

/// In-memory template set, optionally loaded from a directory.
#[derive(Default)]
pub struct TemplateViews {
    templates: RwLock<HashMap<String, String>>,
}

impl TemplateViews {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(self, name: &str, source: &str) -> Self {
        self.insert(name, source);
        self
    }

    /// Load every `*.html` file in `dir`, named by file stem.
    pub fn from_dir(dir: &Path) -> Result<Self, LiveError> {
        let views = Self::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("html") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let source = std::fs::read_to_string(&path)?;
            views.insert(name, &source);
        }
        Ok(views)
    }

    pub fn insert(&self, name: &str, source: &str) {
        let mut templates = self
            .templates
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        templates.insert(name.to_string(), source.to_string());
    }

    fn source(&self, name: &str) -> Result<String, LiveError> {
        let templates = self
            .templates
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        templates
            .get(name)
            .cloned()
            .ok_or_else(|| LiveError::render(format!("template not found: {}", name)))
    }
}

impl ViewSource for TemplateViews {
    fn render(&self, name: &str, rc: &RenderContext<'_>, layouts: &[String]) -> Result<String, LiveError> {
        let mut html = expand(&self.source(name)?, rc, None)?;
        for layout in layouts {
            html = expand(&self.source(layout)?, rc, Some(&html))?;
        }
        Ok(html)
    }
}

fn expand(template: &str, rc: &RenderContext<'_>, content: Option<&str>) -> Result<String, LiveError> {
    let mut html = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("<%=") {
        html.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        let end = after
            .find("%>")
            .ok_or_else(|| LiveError::render("unterminated <%= tag"))?;
        html.push_str(&evaluate_expression(after[..end].trim(), rc, content)?);
        rest = &after[end + 2..];
    }
    html.push_str(rest);

    Ok(html)
}

fn evaluate_expression(expr: &str, rc: &RenderContext<'_>, content: Option<&str>) -> Result<String, LiveError> {
    if expr == "yield" {
        return content
            .map(str::to_string)
            .ok_or_else(|| LiveError::render("yield outside of a layout"));
    }
    if expr == "@connected" {
        return Ok(rc.connected.to_string());
    }

    let Some(path) = expr.strip_prefix('@') else {
        return Err(LiveError::render(format!("unsupported expression: {}", expr)));
    };
    let mut parts = path.split('.');
    let mut value = parts.next().and_then(|key| rc.assigns.get(key));
    for key in parts {
        value = value.and_then(|v| v.get(key));
    }

    Ok(match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => escape_html(s),
        Some(other) => escape_html(&other.to_string()),
    })
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::socket::{into_assigns, Assigns};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn rc(assigns: &Assigns, connected: bool) -> RenderContext<'_> {
        RenderContext {
            assigns,
            connected,
        }
    }

    #[test]
    fn test_substitutes_assigns() {
        let views = TemplateViews::new().with_template(
            "counter",
            "<p><%= @count %> by <%= @user.name %><%= @missing %></p>",
        );
        let assigns = into_assigns(json!({"count": 3, "user": {"name": "<b>ann</b>"}}));
        let html = views.render("counter", &rc(&assigns, false), &[]).unwrap();
        assert_eq!(html, "<p>3 by &lt;b&gt;ann&lt;/b&gt;</p>");
    }

    #[test]
    fn test_layouts_wrap_content() {
        let views = TemplateViews::new()
            .with_template("page", "<main><%= @connected %></main>")
            .with_template("layout", "<body><%= yield %></body>");
        let assigns = Assigns::new();
        let html = views
            .render("page", &rc(&assigns, true), &["layout".to_string()])
            .unwrap();
        assert_eq!(html, "<body><main>true</main></body>");
    }

    #[test]
    fn test_render_errors() {
        let views = TemplateViews::new()
            .with_template("open", "<p><%= @count </p>")
            .with_template("bare", "<%= yield %>");
        let assigns = Assigns::new();
        assert!(matches!(
            views.render("nope", &rc(&assigns, false), &[]),
            Err(LiveError::Render(_))
        ));
        assert!(views.render("open", &rc(&assigns, false), &[]).is_err());
        assert!(views.render("bare", &rc(&assigns, false), &[]).is_err());
    }

    #[test]
    fn test_views_renderer_uses_context_views() {
        let render = with_views_renderer("page", &[]);
        let assigns = Assigns::new();
        let ctx = LiveContext::connection(uuid::Uuid::new_v4(), None);
        assert!(render(&ctx, &rc(&assigns, true)).is_err());

        let views: std::sync::Arc<dyn ViewSource> =
            std::sync::Arc::new(TemplateViews::new().with_template("page", "ok"));
        let ctx = LiveContext::connection(uuid::Uuid::new_v4(), Some(views));
        assert_eq!(render(&ctx, &rc(&assigns, true)).unwrap(), "ok");
    }

    #[test]
    fn test_from_dir_loads_html_files() {
        let dir = std::env::temp_dir().join(format!("livehyper-views-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("hello.html"), "hi <%= @name %>").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let views = TemplateViews::from_dir(&dir).unwrap();
        let assigns = into_assigns(json!({"name": "bo"}));
        assert_eq!(views.render("hello", &rc(&assigns, false), &[]).unwrap(), "hi bo");
        assert!(views.render("notes", &rc(&assigns, false), &[]).is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
