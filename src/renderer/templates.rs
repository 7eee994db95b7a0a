//! Template lookup and filling for the command renderer.
//!
//! Templates live below one directory, one sub-directory per kind:
//!
//! ```text
//! templates/
//!   layouts/classic.tex
//!   covers/matte.tex
//!   impose/saddle-stitch.tex
//! ```

use crate::error::RenderError;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use template_descriptor::{parse_template_descriptor, TemplateDescriptor, TemplateKind};
use tracing::warn;

pub const TEMPLATE_EXT: &str = "tex";

/// A template found on disk together with its parsed header.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateEntry {
    pub kind: TemplateKind,
    /// File stem; what a `TemplateSelection` refers to.
    pub name: String,
    pub path: PathBuf,
    pub descriptor: TemplateDescriptor,
}

/// A template ready to be used by one render.
#[derive(Debug, Clone)]
pub(crate) struct LoadedTemplate {
    pub path: PathBuf,
    pub source: String,
    pub descriptor: TemplateDescriptor,
}

pub(crate) fn template_path(dir: &Path, kind: TemplateKind, name: &str) -> Result<PathBuf, RenderError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.starts_with('.');
    if !valid {
        return Err(RenderError::permanent(format!("invalid template name '{name}'")));
    }
    Ok(dir
        .join(kind.dir_name())
        .join(format!("{name}.{TEMPLATE_EXT}")))
}

/// Read and parse `<dir>/<kind>/<name>.tex`.
pub(crate) fn load_template(
    dir: &Path,
    kind: TemplateKind,
    name: &str,
) -> Result<LoadedTemplate, RenderError> {
    let path = template_path(dir, kind, name)?;
    let bytes = std::fs::read(&path).map_err(|e| {
        RenderError::permanent(format!("{kind} template '{name}' ({}): {e}", path.display()))
    })?;
    let descriptor = parse_template_descriptor(&bytes).map_err(|e| {
        RenderError::permanent(format!("{kind} template '{name}' has a bad header: {e}"))
    })?;
    if let Some(declared) = descriptor.kind {
        if declared != kind {
            return Err(RenderError::permanent(format!(
                "template '{name}' declares kind {declared}, expected {kind}"
            )));
        }
    }
    // parse_template_descriptor already rejected invalid UTF-8.
    let source = String::from_utf8_lossy(&bytes).into_owned();
    Ok(LoadedTemplate {
        path,
        source,
        descriptor,
    })
}

/// Every readable template below `dir`, sorted by kind then name.
///
/// Files whose header does not parse are skipped with a warning.
pub fn list_templates(dir: impl AsRef<Path>) -> std::io::Result<Vec<TemplateEntry>> {
    let dir = dir.as_ref();
    let mut entries = Vec::new();
    for kind in [TemplateKind::Layout, TemplateKind::Cover, TemplateKind::Impose] {
        let kind_dir = dir.join(kind.dir_name());
        let read = match std::fs::read_dir(&kind_dir) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };

        let mut found = Vec::new();
        for file in read {
            let path = file?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TEMPLATE_EXT) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_owned) else {
                continue;
            };
            match std::fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|b| parse_template_descriptor(&b).map_err(|e| e.to_string()))
            {
                Ok(descriptor) => found.push(TemplateEntry {
                    kind,
                    name,
                    path,
                    descriptor,
                }),
                Err(e) => warn!("Skipping template {}: {}", path.display(), e),
            }
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));
        entries.extend(found);
    }
    Ok(entries)
}

// ── Filling ──────────────────────────────────────────────────────────────

/// `$if(var)$ … [$else$ …] $endif$`, not nested.
static RE_CONDITIONAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\$if\(([A-Za-z][\w-]*)\)\$(.*?)(?:\$else\$(.*?))?\$endif\$").unwrap()
});

/// `$$` or `$var$`.
static RE_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\$|\$([A-Za-z][\w-]*)\$").unwrap());

/// Fill a template the way Pandoc would for flat variables.
///
/// A variable is truthy when present and neither empty nor `"false"`.
/// Unknown placeholders become empty strings; `$$` is a literal dollar.
pub(crate) fn fill_template(source: &str, vars: &BTreeMap<String, String>) -> String {
    let truthy = |key: &str| {
        vars.get(key)
            .is_some_and(|v| !v.is_empty() && v != "false")
    };

    let resolved = RE_CONDITIONAL.replace_all(source, |caps: &Captures<'_>| {
        if truthy(&caps[1]) {
            caps[2].to_string()
        } else {
            caps.get(3).map_or_else(String::new, |m| m.as_str().to_string())
        }
    });

    RE_PLACEHOLDER
        .replace_all(&resolved, |caps: &Captures<'_>| match caps.get(1) {
            None => "$".to_string(),
            Some(name) => vars.get(name.as_str()).cloned().unwrap_or_default(),
        })
        .into_owned()
}
