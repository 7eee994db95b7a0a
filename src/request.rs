//! Build requests: what a caller asks the scheduler to produce.

use crate::error::BuildError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The three derived artifacts a manuscript can be built into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildKind {
    /// Markdown manuscript → interior PDF through a layout template.
    Convert,
    /// Interior PDF → cover PDF through a cover template.
    CompileCover,
    /// Interior PDF → imposed PDF through an imposition template.
    Impose,
}

impl BuildKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildKind::Convert => "convert",
            BuildKind::CompileCover => "compile_cover",
            BuildKind::Impose => "impose",
        }
    }

    /// Stable one-byte tag used in fingerprints.
    pub(crate) fn tag(self) -> u8 {
        match self {
            BuildKind::Convert => 1,
            BuildKind::CompileCover => 2,
            BuildKind::Impose => 3,
        }
    }
}

impl fmt::Display for BuildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildKind {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "convert" => Ok(BuildKind::Convert),
            "compile_cover" | "cover" => Ok(BuildKind::CompileCover),
            "impose" => Ok(BuildKind::Impose),
            other => Err(BuildError::invalid(format!("unknown build kind '{other}'"))),
        }
    }
}

/// Which templates to use and how to parameterise them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateSelection {
    /// Layout template name (Convert).
    pub layout: String,
    /// Cover template name (CompileCover).
    pub cover: String,
    /// Imposition template name (Impose).
    pub impose: String,
    /// Template switches, passed as `-V key=true|false`.
    pub boolean_options: BTreeMap<String, bool>,
    /// Document metadata, passed as `-M key=value`.
    pub metadata: BTreeMap<String, String>,
    /// Paper thickness in millimetres per sheet (cover spine width).
    pub paper_thickness: Option<f64>,
}

impl TemplateSelection {
    pub fn layout(name: impl Into<String>) -> Self {
        Self {
            layout: name.into(),
            ..Self::default()
        }
    }

    pub fn cover(name: impl Into<String>) -> Self {
        Self {
            cover: name.into(),
            ..Self::default()
        }
    }

    pub fn impose(name: impl Into<String>) -> Self {
        Self {
            impose: name.into(),
            ..Self::default()
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: bool) -> Self {
        self.boolean_options.insert(key.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_paper_thickness(mut self, mm: f64) -> Self {
        self.paper_thickness = Some(mm);
        self
    }

    /// The template name the given kind renders with.
    pub fn template_for(&self, kind: BuildKind) -> &str {
        match kind {
            BuildKind::Convert => &self.layout,
            BuildKind::CompileCover => &self.cover,
            BuildKind::Impose => &self.impose,
        }
    }
}

/// One immutable build request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub kind: BuildKind,
    /// Markdown for Convert; the interior PDF for CompileCover and Impose.
    pub source_content: Vec<u8>,
    pub template: TemplateSelection,
    /// Who asked. Not part of the fingerprint.
    pub requester_id: Option<String>,
}

impl BuildRequest {
    pub fn new(kind: BuildKind, source_content: impl Into<Vec<u8>>, template: TemplateSelection) -> Self {
        Self {
            kind,
            source_content: source_content.into(),
            template,
            requester_id: None,
        }
    }

    pub fn convert(markdown: impl Into<Vec<u8>>, layout: impl Into<String>) -> Self {
        Self::new(BuildKind::Convert, markdown, TemplateSelection::layout(layout))
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester_id = Some(requester.into());
        self
    }

    /// Check the admission constraints.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.source_content.is_empty() {
            return Err(BuildError::invalid("source content is empty"));
        }

        let template = self.template.template_for(self.kind);
        if template.trim().is_empty() {
            let field = match self.kind {
                BuildKind::Convert => "layout",
                BuildKind::CompileCover => "cover",
                BuildKind::Impose => "impose",
            };
            return Err(BuildError::invalid(format!(
                "templateSelection.{field} is required for {} builds",
                self.kind
            )));
        }

        if let Some(t) = self.template.paper_thickness {
            if !t.is_finite() || t <= 0.0 {
                return Err(BuildError::invalid(format!(
                    "paper thickness must be a positive number of millimetres, got {t}"
                )));
            }
        }

        if let Some(key) = self
            .template
            .boolean_options
            .keys()
            .chain(self.template.metadata.keys())
            .find(|k| k.trim().is_empty())
        {
            return Err(BuildError::invalid(format!(
                "template option and metadata keys must be non-empty (got {key:?})"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kind_aliases() {
        assert_eq!("convert".parse::<BuildKind>().unwrap(), BuildKind::Convert);
        assert_eq!(
            "compile-cover".parse::<BuildKind>().unwrap(),
            BuildKind::CompileCover
        );
        assert_eq!("Cover".parse::<BuildKind>().unwrap(), BuildKind::CompileCover);
        assert!("poster".parse::<BuildKind>().is_err());
    }

    #[test]
    fn empty_content_is_invalid() {
        let r = BuildRequest::convert(Vec::new(), "classic");
        assert!(matches!(r.validate(), Err(BuildError::InvalidRequest { .. })));
    }

    #[test]
    fn convert_requires_layout() {
        let r = BuildRequest::convert("# Title", "  ");
        let err = r.validate().unwrap_err();
        assert!(err.to_string().contains("layout"), "got: {err}");
    }

    #[test]
    fn cover_requires_cover_template_not_layout() {
        let r = BuildRequest::new(
            BuildKind::CompileCover,
            b"%PDF-1.7".to_vec(),
            TemplateSelection::layout("classic"),
        );
        assert!(r.validate().unwrap_err().to_string().contains("cover"));

        let ok = BuildRequest::new(
            BuildKind::CompileCover,
            b"%PDF-1.7".to_vec(),
            TemplateSelection::cover("matte"),
        );
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn paper_thickness_must_be_positive() {
        let mut r = BuildRequest::convert("# T", "classic");
        r.template.paper_thickness = Some(0.0);
        assert!(r.validate().is_err());
        r.template.paper_thickness = Some(f64::NAN);
        assert!(r.validate().is_err());
        r.template.paper_thickness = Some(0.1);
        assert!(r.validate().is_ok());
    }

    #[test]
    fn blank_option_key_is_invalid() {
        let mut r = BuildRequest::convert("# T", "classic");
        r.template = r.template.with_option("", true);
        assert!(r.validate().is_err());
    }

    #[test]
    fn selection_deserialises_with_defaults() {
        let sel: TemplateSelection =
            serde_json::from_str(r#"{"layout":"classic","boolean_options":{"draft":true}}"#).unwrap();
        assert_eq!(sel.layout, "classic");
        assert!(sel.cover.is_empty());
        assert_eq!(sel.boolean_options.get("draft"), Some(&true));
        assert!(sel.paper_thickness.is_none());
    }
}
