//! Deterministic identifiers for dataset files.

use crate::policy::{DATASET_HANDLES, INJECTED_HANDLES};
use crate::types::AliasBinding;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_ALIAS_PREFIX: &str = "df";

const PYTHON_KEYWORDS: &[&str] = &[
    "false", "none", "true", "and", "as", "assert", "async", "await", "break", "class", "continue",
    "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if", "import", "in",
    "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while", "with",
    "yield", "match", "case", "type",
];

/// Lowercase identifier base for a file path.
pub fn sanitize_alias(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut cleaned = String::with_capacity(stem.len());
    let mut in_run = false;
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            cleaned.push(c.to_ascii_lowercase());
            in_run = false;
        } else if !in_run {
            cleaned.push('_');
            in_run = true;
        }
    }
    let cleaned = cleaned.trim_matches('_');

    if cleaned.is_empty() {
        "dataset".to_string()
    } else if cleaned.starts_with(|c: char| c.is_ascii_digit()) {
        format!("data_{cleaned}")
    } else {
        cleaned.to_string()
    }
}

fn is_reserved(name: &str) -> bool {
    PYTHON_KEYWORDS.contains(&name)
        || DATASET_HANDLES.contains(&name)
        || INJECTED_HANDLES.iter().any(|(handle, _)| *handle == name)
}

#[derive(Debug, Clone)]
pub struct AliasResolver {
    prefix: Option<String>,
}

impl Default for AliasResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl AliasResolver {
    pub fn new() -> Self {
        Self {
            prefix: Some(DEFAULT_ALIAS_PREFIX.to_string()),
        }
    }

    /// `None` or an empty prefix yields bare names.
    pub fn with_prefix(mut self, prefix: Option<&str>) -> Self {
        self.prefix = prefix.filter(|p| !p.is_empty()).map(str::to_string);
        self
    }

    /// One binding per path, in input order. Identical inputs always yield
    /// identical aliases.
    pub fn resolve<P: AsRef<Path>>(&self, paths: &[P]) -> Vec<AliasBinding> {
        let mut taken: HashSet<String> = HashSet::new();
        let mut bindings = Vec::with_capacity(paths.len());

        for path in paths {
            let path = path.as_ref();
            let base = sanitize_alias(path);
            let stem = match &self.prefix {
                Some(prefix) => format!("{prefix}_{base}"),
                None if is_reserved(&base) => format!("data_{base}"),
                None => base,
            };

            let mut alias = stem.clone();
            let mut counter = 1;
            while taken.contains(&alias) {
                counter += 1;
                alias = format!("{stem}_{counter}");
            }
            taken.insert(alias.clone());
            bindings.push(AliasBinding {
                alias,
                path: PathBuf::from(path),
            });
        }
        bindings
    }
}

/// Resolve with the default `df` prefix.
pub fn resolve_aliases<P: AsRef<Path>>(paths: &[P]) -> Vec<AliasBinding> {
    AliasResolver::new().resolve(paths)
}
