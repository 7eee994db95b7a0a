//! # template-descriptor
//!
//! Parse the metadata header that print templates carry in LaTeX comments,
//! and list the Pandoc variables a template body references.
//!
//! Every layout, cover and imposition template starts with a block of `%%`
//! comment lines describing itself:
//!
//! ```text
//! %% @name: Classic novel
//! %% @description: Serif body text, drop caps on chapter openings
//! %% @kind: layout
//! %% @paper: a5
//! %% @option dropcaps: Drop capitals [default: true]
//! %% @option draft: Draft watermark
//! %% @meta title: Book title [required]
//! %% @meta author: Author name
//! \documentclass{book}
//! \title{$title$}
//! $if(draft)$\usepackage{draftwatermark}$endif$
//! ```
//!
//! [`parse_template_descriptor`] is a pure function: it never touches the
//! filesystem, so callers decide where templates come from (a directory, a
//! database row, an upload).
//!
//! ## Usage
//!
//! ```rust
//! use template_descriptor::{parse_template_descriptor, TemplateKind};
//!
//! let src = b"%% @name: Plain\n%% @kind: cover\n%% @meta title: Title [required]\n\\title{$title$}\n";
//! let d = parse_template_descriptor(src).unwrap();
//! assert_eq!(d.name, "Plain");
//! assert_eq!(d.kind, Some(TemplateKind::Cover));
//! assert!(d.variables.contains("title"));
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Error types ──────────────────────────────────────────────────────────────

/// Errors returned while parsing a template header.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    /// The template is not valid UTF-8.
    #[error("Template is not valid UTF-8 (first invalid byte at offset {valid_up_to})")]
    NotUtf8 { valid_up_to: usize },

    /// No `@name` directive was found.
    #[error("Template header has no '@name' directive")]
    MissingName,

    /// `@kind` named something other than layout, cover or impose.
    #[error("Line {line}: unknown template kind '{value}' (expected layout, cover or impose)")]
    UnknownKind { line: usize, value: String },

    /// `@option` or `@meta` was written without a key.
    #[error("Line {line}: '@{directive}' needs a key, e.g. '@{directive} title: …'")]
    MissingKey { line: usize, directive: String },

    /// The same option or metadata key was declared twice.
    #[error("Line {line}: '{key}' is declared more than once")]
    DuplicateKey { line: usize, key: String },

    /// `[default: …]` held something that is not a boolean.
    #[error("Line {line}: default for option '{key}' must be a boolean, got '{value}'")]
    MalformedDefault {
        line: usize,
        key: String,
        value: String,
    },
}

/// A template selection that does not match what the template declares.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    /// A boolean option was requested that the template does not declare.
    #[error("Template '{template}' has no option '{key}'")]
    UnknownOption { template: String, key: String },

    /// A metadata field marked `[required]` was not provided.
    #[error("Template '{template}' requires metadata '{key}'")]
    MissingMetadata { template: String, key: String },
}

// ── Types ────────────────────────────────────────────────────────────────────

/// Which build stage a template is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    Layout,
    Cover,
    Impose,
}

impl TemplateKind {
    /// Directory name conventionally holding templates of this kind.
    pub fn dir_name(self) -> &'static str {
        match self {
            TemplateKind::Layout => "layouts",
            TemplateKind::Cover => "covers",
            TemplateKind::Impose => "impose",
        }
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TemplateKind::Layout => "layout",
            TemplateKind::Cover => "cover",
            TemplateKind::Impose => "impose",
        })
    }
}

impl FromStr for TemplateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "layout" => Ok(TemplateKind::Layout),
            "cover" => Ok(TemplateKind::Cover),
            "impose" | "imposition" => Ok(TemplateKind::Impose),
            other => Err(other.to_string()),
        }
    }
}

/// A boolean switch the template understands (`-V key=true`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BooleanOption {
    pub key: String,
    pub label: String,
    pub default: bool,
}

/// A metadata field the template reads (`-M key=value`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub key: String,
    pub label: String,
    pub required: bool,
}

/// Everything the header and body of a template say about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub kind: Option<TemplateKind>,
    pub paper: Option<String>,
    pub options: Vec<BooleanOption>,
    pub metadata: Vec<MetadataField>,
    /// Pandoc variables referenced in the template body, keywords excluded.
    pub variables: BTreeSet<String>,
    /// Directives this parser does not interpret, kept verbatim.
    pub extra: BTreeMap<String, String>,
}

impl TemplateDescriptor {
    pub fn option(&self, key: &str) -> Option<&BooleanOption> {
        self.options.iter().find(|o| o.key == key)
    }

    pub fn required_metadata(&self) -> impl Iterator<Item = &MetadataField> {
        self.metadata.iter().filter(|m| m.required)
    }

    /// Merge requested switches over the declared defaults.
    ///
    /// Every declared option appears in the result. Requesting an option the
    /// template does not declare is an error.
    pub fn effective_options(
        &self,
        requested: &BTreeMap<String, bool>,
    ) -> Result<BTreeMap<String, bool>, SelectionError> {
        if let Some(key) = requested.keys().find(|k| self.option(k).is_none()) {
            return Err(SelectionError::UnknownOption {
                template: self.name.clone(),
                key: key.clone(),
            });
        }
        Ok(self
            .options
            .iter()
            .map(|o| {
                let value = requested.get(&o.key).copied().unwrap_or(o.default);
                (o.key.clone(), value)
            })
            .collect())
    }

    /// Check that every `[required]` metadata field is present and non-blank.
    pub fn check_metadata(
        &self,
        provided: &BTreeMap<String, String>,
    ) -> Result<(), SelectionError> {
        for field in self.required_metadata() {
            let present = provided
                .get(&field.key)
                .map(|v| !v.trim().is_empty())
                .unwrap_or(false);
            if !present {
                return Err(SelectionError::MissingMetadata {
                    template: self.name.clone(),
                    key: field.key.clone(),
                });
            }
        }
        Ok(())
    }
}

// ── Parsing ──────────────────────────────────────────────────────────────────

/// `%% @directive key: value`; the key is optional.
static RE_DIRECTIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*%+\s*@([A-Za-z][\w-]*)(?:\s+([A-Za-z][\w.-]*))?\s*:\s*(.*?)\s*$").unwrap()
});

static RE_DEFAULT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*?)\s*\[\s*default\s*:\s*([^\]]*?)\s*\]\s*$").unwrap());

static RE_REQUIRED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(.*?)\s*\[\s*required\s*\]\s*$").unwrap());

/// Head of a Pandoc template directive: `var`, `var.field`, `if(var)`,
/// `for(var)`, `var:partial()`.
static RE_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:(?:if|elseif|for)\(\s*)?([A-Za-z][\w-]*)").unwrap());

const TEMPLATE_KEYWORDS: &[&str] = &["if", "elseif", "else", "endif", "for", "endfor", "sep", "it"];

/// Parse a template's header directives and body variables.
///
/// Comment lines (`%…`) are scanned for `@directive` entries; every other
/// line is scanned for Pandoc variable references.
pub fn parse_template_descriptor(bytes: &[u8]) -> Result<TemplateDescriptor, DescriptorError> {
    let text = std::str::from_utf8(bytes).map_err(|e| DescriptorError::NotUtf8 {
        valid_up_to: e.valid_up_to(),
    })?;
    let text = text.strip_prefix('\u{FEFF}').unwrap_or(text);

    let mut name: Option<String> = None;
    let mut description: Vec<String> = Vec::new();
    let mut kind = None;
    let mut paper = None;
    let mut options: Vec<BooleanOption> = Vec::new();
    let mut metadata: Vec<MetadataField> = Vec::new();
    let mut variables = BTreeSet::new();
    let mut extra = BTreeMap::new();

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;

        if line.trim_start().starts_with('%') {
            let Some(caps) = RE_DIRECTIVE.captures(line) else {
                continue;
            };
            let directive = caps[1].to_ascii_lowercase();
            let key = caps.get(2).map(|m| m.as_str().to_string());
            let value = caps[3].to_string();

            match directive.as_str() {
                "name" => name = Some(value),
                "description" => description.push(value),
                "kind" => {
                    kind = Some(value.parse::<TemplateKind>().map_err(|value| {
                        DescriptorError::UnknownKind {
                            line: line_no,
                            value,
                        }
                    })?)
                }
                "paper" => paper = Some(value.to_ascii_lowercase()),
                "option" => {
                    let key = require_key(key, line_no, "option")?;
                    if options.iter().any(|o| o.key == key) {
                        return Err(DescriptorError::DuplicateKey { line: line_no, key });
                    }
                    let (label, default) = split_default(&value, &key, line_no)?;
                    options.push(BooleanOption {
                        key,
                        label,
                        default,
                    });
                }
                "meta" => {
                    let key = require_key(key, line_no, "meta")?;
                    if metadata.iter().any(|m| m.key == key) {
                        return Err(DescriptorError::DuplicateKey { line: line_no, key });
                    }
                    let (label, required) = match RE_REQUIRED.captures(&value) {
                        Some(c) => (c[1].to_string(), true),
                        None => (value, false),
                    };
                    metadata.push(MetadataField {
                        key,
                        label,
                        required,
                    });
                }
                _ => {
                    let full = match key {
                        Some(k) => format!("{directive} {k}"),
                        None => directive,
                    };
                    extra.insert(full, value);
                }
            }
            continue;
        }

        scan_variables(line, &mut variables);
    }

    let name = name
        .filter(|n| !n.trim().is_empty())
        .ok_or(DescriptorError::MissingName)?;

    Ok(TemplateDescriptor {
        name,
        description: if description.is_empty() {
            None
        } else {
            Some(description.join(" "))
        },
        kind,
        paper,
        options,
        metadata,
        variables,
        extra,
    })
}

/// Walk a body line left to right the way Pandoc does: `$$` is a literal
/// dollar, `${…}` and `$…$` delimit directives.
fn scan_variables(line: &str, out: &mut BTreeSet<String>) {
    let mut rest = line;
    while let Some(start) = rest.find('$') {
        let after = &rest[start + 1..];
        if let Some(tail) = after.strip_prefix('$') {
            rest = tail;
            continue;
        }
        let (inner, tail) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], &braced[end + 1..]),
                None => break,
            }
        } else {
            match after.find('$') {
                Some(end) => (&after[..end], &after[end + 1..]),
                None => break,
            }
        };
        if let Some(caps) = RE_REFERENCE.captures(inner) {
            let var = &caps[1];
            if !TEMPLATE_KEYWORDS.contains(&var) {
                out.insert(var.to_string());
            }
        }
        rest = tail;
    }
}

fn require_key(key: Option<String>, line: usize, directive: &str) -> Result<String, DescriptorError> {
    key.ok_or_else(|| DescriptorError::MissingKey {
        line,
        directive: directive.to_string(),
    })
}

fn split_default(value: &str, key: &str, line: usize) -> Result<(String, bool), DescriptorError> {
    let Some(caps) = RE_DEFAULT.captures(value) else {
        return Ok((value.to_string(), false));
    };
    let raw = caps[2].to_ascii_lowercase();
    let default = match raw.as_str() {
        "true" | "yes" | "on" | "1" => true,
        "false" | "no" | "off" | "0" => false,
        _ => {
            return Err(DescriptorError::MalformedDefault {
                line,
                key: key.to_string(),
                value: caps[2].to_string(),
            })
        }
    };
    Ok((caps[1].to_string(), default))
}

// ── Tests ────────────────────────────────────────────────────────────────────
