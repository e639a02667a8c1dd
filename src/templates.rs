//! Template Renderer
//!
//! Turns a template plus a data payload into TeX source using Tera.
//! Templates come from a [`TemplateSource`]: the filesystem by default, or
//! an in-memory bundle compiled into the binary.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tera::{Context, Tera};

use crate::error::PipelineError;

pub const DEFAULT_TEMPLATES_FOLDER: &str = "templates";
pub const DEFAULT_TEMPLATE_NAME: &str = "template.tmpl";

/// One entry directly inside a template folder.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourceEntry {
    pub name: OsString,
    pub is_dir: bool,
}

/// Where template definitions and their companion files are read from.
pub trait TemplateSource: fmt::Debug + Send + Sync {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Entries directly inside `dir`, sorted by name.
    fn list(&self, dir: &Path) -> io::Result<Vec<SourceEntry>>;
}

/// Reads templates from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskSource;

impl TemplateSource for DiskSource {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<SourceEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            entries.push(SourceEntry {
                name: entry.file_name(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        entries.sort();
        Ok(entries)
    }
}

/// Templates bundled in memory, typically with `include_str!`/`include_bytes!`.
///
/// Paths are relative, `/`-separated keys such as `templates/template.tmpl`.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedSource {
    files: BTreeMap<PathBuf, Vec<u8>>,
}

impl EmbeddedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl AsRef<Path>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(normalize(path.as_ref()), contents.into());
        self
    }
}

impl TemplateSource for EmbeddedSource {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.files.get(&normalize(path)).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not in the embedded bundle", path.display()),
            )
        })
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<SourceEntry>> {
        let dir = normalize(dir);
        let mut entries = BTreeSet::new();
        for path in self.files.keys() {
            let Ok(rest) = path.strip_prefix(&dir) else {
                continue;
            };
            let mut parts = rest.components();
            if let Some(first) = parts.next() {
                entries.insert(SourceEntry {
                    name: first.as_os_str().to_os_string(),
                    is_dir: parts.next().is_some(),
                });
            }
        }
        if entries.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not in the embedded bundle", dir.display()),
            ));
        }
        Ok(entries.into_iter().collect())
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

pub type RenderFn = Arc<dyn Fn(&HashMap<String, Value>) -> tera::Result<Value> + Send + Sync>;

/// Named helpers callable from templates, e.g. `{{ today(format="%Y") }}`.
#[derive(Clone, Default)]
pub struct RenderFunctions {
    functions: BTreeMap<String, RenderFn>,
}

impl RenderFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&HashMap<String, Value>) -> tera::Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    fn register(&self, tera: &mut Tera) {
        for (name, function) in &self.functions {
            let function = Arc::clone(function);
            tera.register_function(name, move |args: &HashMap<String, Value>| function(args));
        }
    }
}

impl fmt::Debug for RenderFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.functions.keys()).finish()
    }
}

/// Load `folder/name` from `source` into a fresh engine.
pub fn load(
    source: &dyn TemplateSource,
    folder: &Path,
    name: &str,
) -> Result<Tera, PipelineError> {
    if name.is_empty() {
        return Err(PipelineError::Configuration("template name is empty".into()));
    }
    let path = folder.join(name);
    let bytes = source.read(&path).map_err(|e| {
        PipelineError::Template(format!("could not read template {}: {}", path.display(), e))
    })?;
    let text = String::from_utf8(bytes).map_err(|_| {
        PipelineError::Template(format!("template {} is not valid UTF-8", path.display()))
    })?;

    let mut tera = Tera::default();
    tera.add_raw_template(name, &protect_tex(&text))
        .map_err(|e| PipelineError::Template(describe(&e)))?;
    Ok(tera)
}

/// Keep TeX's `{#` and `{%` out of Tera's hands.
///
/// TeX writes `{#1}` for macro parameters and ends lines with `{%`, both of
/// which Tera would read as an unclosed comment or tag. A `{%` opens a tag
/// only when followed by whitespace or `-` and closed by `%}` on the same
/// line; a `{#` opens a comment only when followed by whitespace or `-` and
/// closed by a later `#}`. Any other occurrence is wrapped in a raw block so
/// it renders as written. `{{ ... }}` expressions pass through untouched.
///
/// Applied to every template read by [`load`]; call it yourself on text fed
/// to a hand-built engine.
pub fn protect_tex(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('{') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let (closer, same_line) = match rest.as_bytes().get(1) {
            Some(b'{') => ("}}", false),
            Some(b'%') => ("%}", true),
            Some(b'#') => ("#}", false),
            _ => {
                out.push('{');
                rest = &rest[1..];
                continue;
            }
        };
        match tera_span(rest, closer, same_line) {
            Some(end) => {
                out.push_str(&rest[..end]);
                rest = &rest[end..];
            }
            None => {
                out.push_str("{% raw %}");
                out.push_str(&rest[..2]);
                out.push_str("{% endraw %}");
                rest = &rest[2..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Byte length of the Tera construct at the start of `text`, if it is one.
fn tera_span(text: &str, closer: &str, same_line: bool) -> Option<usize> {
    let body = &text[2..];
    if !text.starts_with("{{") && !body.starts_with(|c: char| c.is_whitespace() || c == '-') {
        return None;
    }
    let scope = match body.find('\n') {
        Some(eol) if same_line => &body[..eol],
        _ => body,
    };
    scope.find(closer).map(|i| 2 + i + closer.len())
}

/// Render template `name` from `tera` with `data`.
///
/// The payload is visible as `data`; when it is an object its keys are also
/// available at top level.
pub fn render(
    tera: &mut Tera,
    name: &str,
    data: &Value,
    functions: &RenderFunctions,
) -> Result<String, PipelineError> {
    tera.register_filter("latex_escape", latex_escape);
    functions.register(tera);

    let mut context = match data {
        Value::Object(_) => Context::from_value(data.clone())
            .map_err(|e| PipelineError::Template(describe(&e)))?,
        _ => Context::new(),
    };
    context.insert("data", data);

    tera.render(name, &context)
        .map_err(|e| PipelineError::Template(describe(&e)))
}

/// Tera keeps the useful detail in the source chain.
fn describe(err: &tera::Error) -> String {
    let mut msg = err.to_string();
    let mut cause = std::error::Error::source(err);
    while let Some(e) = cause {
        msg.push_str(": ");
        msg.push_str(&e.to_string());
        cause = std::error::Error::source(e);
    }
    msg
}

/// Escape TeX special characters in strings, numbers and booleans.
pub fn latex_escape(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => return Err(tera::Error::msg("latex_escape filter expects a scalar")),
    };
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str(r"\textbackslash{}"),
            '~' => out.push_str(r"\textasciitilde{}"),
            '^' => out.push_str(r"\textasciicircum{}"),
            '{' | '}' | '$' | '&' | '#' | '_' | '%' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    Ok(Value::String(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LIST_TEMPLATE: &str =
        "\\begin{itemize}{% for item in data %}\\item {{ item }}{% endfor %}\\end{itemize}";

    #[test]
    fn test_render_list_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("template.tmpl"), LIST_TEMPLATE).unwrap();

        let mut tera = load(&DiskSource, dir.path(), "template.tmpl").unwrap();
        let out = render(&mut tera, "template.tmpl", &json!(["a", "b", "c"]), &RenderFunctions::new())
            .unwrap();
        assert_eq!(out, "\\begin{itemize}\\item a\\item b\\item c\\end{itemize}");
    }

    #[test]
    fn test_object_keys_at_top_level() {
        let source = EmbeddedSource::new().with_file("t/doc.tmpl", "{{ title }}/{{ data.title }}");
        let mut tera = load(&source, Path::new("t"), "doc.tmpl").unwrap();
        let out = render(&mut tera, "doc.tmpl", &json!({"title": "Report"}), &RenderFunctions::new())
            .unwrap();
        assert_eq!(out, "Report/Report");
    }

    #[test]
    fn test_missing_field_is_template_error() {
        let source = EmbeddedSource::new().with_file("t/doc.tmpl", "{{ author }}");
        let mut tera = load(&source, Path::new("t"), "doc.tmpl").unwrap();
        let err = render(&mut tera, "doc.tmpl", &json!({}), &RenderFunctions::new()).unwrap_err();
        assert!(matches!(err, PipelineError::Template(_)));
        assert!(err.to_string().contains("author"));
    }

    #[test]
    fn test_missing_template_is_template_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&DiskSource, dir.path(), "template.tmpl").unwrap_err();
        assert!(matches!(err, PipelineError::Template(_)));
    }

    #[test]
    fn test_parse_error_is_template_error() {
        let source = EmbeddedSource::new().with_file("t/doc.tmpl", "{% for x in %}");
        let err = load(&source, Path::new("t"), "doc.tmpl").unwrap_err();
        assert!(matches!(err, PipelineError::Template(_)));
    }

    #[test]
    fn test_render_functions_are_callable() {
        let source = EmbeddedSource::new().with_file("t/doc.tmpl", "{{ shout(text=data) }}");
        let functions = RenderFunctions::new().with("shout", |args: &HashMap<String, Value>| {
            let text = args
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| tera::Error::msg("shout expects text"))?;
            Ok(Value::String(text.to_uppercase()))
        });
        let mut tera = load(&source, Path::new("t"), "doc.tmpl").unwrap();
        let out = render(&mut tera, "doc.tmpl", &json!("hi"), &functions).unwrap();
        assert_eq!(out, "HI");
    }

    #[test]
    fn test_latex_escape_filter() {
        let source =
            EmbeddedSource::new().with_file("t/doc.tmpl", "{{ data | latex_escape }}");
        let mut tera = load(&source, Path::new("t"), "doc.tmpl").unwrap();
        let out = render(&mut tera, "doc.tmpl", &json!("50% of $x_1 & #2"), &RenderFunctions::new())
            .unwrap();
        assert_eq!(out, r"50\% of \$x\_1 \& \#2");
    }

    #[test]
    fn test_embedded_listing() {
        let source = EmbeddedSource::new()
            .with_file("./tpl/template.tmpl", "x")
            .with_file("tpl/logo.png", [1u8, 2, 3])
            .with_file("tpl/img/a.png", [4u8])
            .with_file("other/z.tex", "z");

        let entries = source.list(Path::new("tpl")).unwrap();
        let names: Vec<_> = entries
            .iter()
            .map(|e| (e.name.to_str().unwrap(), e.is_dir))
            .collect();
        assert_eq!(names, vec![("img", true), ("logo.png", false), ("template.tmpl", false)]);
        assert!(source.list(Path::new("missing")).is_err());
        assert_eq!(source.read(Path::new("tpl/logo.png")).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_disk_listing_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.png"), "b").unwrap();
        fs::write(dir.path().join("a.cls"), "a").unwrap();
        fs::create_dir(dir.path().join("fonts")).unwrap();

        let entries = DiskSource.list(dir.path()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.to_str().unwrap()).collect();
        assert_eq!(names, vec!["a.cls", "b.png", "fonts"]);
        assert!(entries[2].is_dir);
    }

    #[cfg(unix)]
    #[test]
    fn test_disk_listing_keeps_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let name = OsStr::from_bytes(b"caf\xe9.png");
        fs::write(dir.path().join(name), "x").unwrap();

        let entries = DiskSource.list(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, name);
        assert_eq!(DiskSource.read(&dir.path().join(&entries[0].name)).unwrap(), b"x");
    }

    #[test]
    fn test_tex_macro_parameters_render_literally() {
        let text = "\\newcommand{\\bold}[1]{\\textbf{#1}}\n\\def\\pair#1#2{(#1,{#2})}\n{{ title }}";
        let source = EmbeddedSource::new().with_file("t/doc.tmpl", text);
        let mut tera = load(&source, Path::new("t"), "doc.tmpl").unwrap();
        let out = render(&mut tera, "doc.tmpl", &json!({"title": "Report"}), &RenderFunctions::new())
            .unwrap();
        assert_eq!(
            out,
            "\\newcommand{\\bold}[1]{\\textbf{#1}}\n\\def\\pair#1#2{(#1,{#2})}\nReport"
        );
    }

    #[test]
    fn test_trailing_percent_brace_renders_literally() {
        let text = "\\newcommand{\\greet}{%\n  Hello {{ name }}}\n{%\n\\end{document}{%";
        let source = EmbeddedSource::new().with_file("t/doc.tmpl", text);
        let mut tera = load(&source, Path::new("t"), "doc.tmpl").unwrap();
        let out = render(&mut tera, "doc.tmpl", &json!({"name": "Ada"}), &RenderFunctions::new())
            .unwrap();
        assert_eq!(out, "\\newcommand{\\greet}{%\n  Hello Ada}\n{%\n\\end{document}{%");
    }

    #[test]
    fn test_tera_tags_and_comments_still_work() {
        let text = "{# multi\nline note #}{% if data.loud -%} LOUD {%- endif %}{%- if false %}x{% endif %}";
        let source = EmbeddedSource::new().with_file("t/doc.tmpl", text);
        let mut tera = load(&source, Path::new("t"), "doc.tmpl").unwrap();
        let out = render(&mut tera, "doc.tmpl", &json!({"loud": true}), &RenderFunctions::new())
            .unwrap();
        assert_eq!(out, "LOUD");
        assert_eq!(protect_tex(LIST_TEMPLATE), LIST_TEMPLATE);
    }
}
