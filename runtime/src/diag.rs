//! Structured diagnostics accumulated through parsing, binding, preparation
//! and evaluation.
//!
//! Error-level diagnostics never abort a phase mid-flight; callers collect
//! them and decide between phases whether to continue.
//!

use std::collections::BTreeMap;
use std::io;

use strum::Display;

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    pub detail: String,
    /// Path of the source file the diagnostic points at, when known.
    pub subject: Option<String>,
}

impl Diagnostic {
    pub fn error(summary: impl Into<String>) -> Self {
        let summary = summary.into();
        Diagnostic {
            severity: Severity::Error,
            detail: summary.clone(),
            summary,
            subject: None,
        }
    }

    pub fn warning(summary: impl Into<String>) -> Self {
        let summary = summary.into();
        Diagnostic {
            severity: Severity::Warning,
            detail: summary.clone(),
            summary,
            subject: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn in_file(mut self, path: &str) -> Self {
        self.subject = Some(path.to_owned());
        self
    }
}

/// An ordered collection of diagnostics.
///
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics(Vec::new())
    }

    pub fn push(&mut self, d: Diagnostic) {
        self.0.push(d);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.0.extend(other.0);
    }

    pub fn has_errors(&self) -> bool {
        self.0.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter()
    }
}

impl From<Diagnostic> for Diagnostics {
    fn from(d: Diagnostic) -> Self {
        Diagnostics(vec![d])
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<Diagnostic> for Diagnostics {
    fn from_iter<T: IntoIterator<Item = Diagnostic>>(iter: T) -> Self {
        Diagnostics(iter.into_iter().collect())
    }
}

/// Render diagnostics as text, teeing in the offending file name when the
/// diagnostic carries one. `files` maps paths to their source text and is
/// only consulted for existence (the structural syntax model does not keep
/// byte ranges).
///
pub fn write_diagnostics(
    w: &mut dyn io::Write,
    files: &BTreeMap<String, String>,
    diags: &Diagnostics,
) -> io::Result<()> {
    for d in diags.iter() {
        writeln!(w, "{}: {}", d.severity, d.summary)?;
        if d.detail != d.summary && !d.detail.is_empty() {
            writeln!(w, "  {}", d.detail)?;
        }
        if let Some(subject) = &d.subject {
            if files.contains_key(subject) {
                writeln!(w, "  in {subject}")?;
            } else {
                writeln!(w, "  in {subject} (source unavailable)")?;
            }
        }
        writeln!(w)?;
    }
    Ok(())
}
