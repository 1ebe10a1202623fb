//! Validation Policy
//!
//! Everything the safety validator decides is driven by a [`ValidationPolicy`]:
//!
//! 1. **Imports** - an allow-list of capability roots, minus denied submodules
//! 2. **Calls** - named rule sets (process, evaluation, file, network, introspection)
//! 3. **Stripping** - interactive display calls removed from the sanitized source
//! 4. **Placeholders** - elided-code markers that make a submission incomplete
//!
//! Policies are plain serde data so they can live in the engine config file.

use crate::types::RuleId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Handles the worker binds before user code runs, with the module each one
/// refers to.
pub const INJECTED_HANDLES: &[(&str, &str)] = &[
    ("plt", "matplotlib.pyplot"),
    ("np", "numpy"),
    ("pd", "pandas"),
    ("sns", "seaborn"),
    ("matplotlib", "matplotlib"),
];

/// Names reserved for dataset collections in the user namespace.
pub const DATASET_HANDLES: &[&str] = &["df", "dfs", "dataframes"];

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

// ============================================================================
// PRIMITIVES
// ============================================================================

/// A family of calls that share a rule id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallRule {
    pub rule: RuleId,
    /// Terminal call names matched on any receiver (`open`, `x.to_csv`)
    #[serde(default)]
    pub names: BTreeSet<String>,
    /// Canonical dotted targets; a trailing `*` matches any suffix
    #[serde(default)]
    pub qualified: BTreeSet<String>,
}

impl CallRule {
    pub fn new(rule: RuleId, names: &[&str], qualified: &[&str]) -> Self {
        Self {
            rule,
            names: set(names),
            qualified: set(qualified),
        }
    }

    /// `terminal` is the last name segment, `dotted` the canonical chain when
    /// the target is a plain name or attribute chain.
    pub fn matches(&self, terminal: &str, dotted: Option<&str>) -> bool {
        if self.names.contains(terminal) {
            return true;
        }
        match dotted {
            Some(dotted) => self.qualified.iter().any(|p| pattern_matches(p, dotted)),
            None => false,
        }
    }
}

pub(crate) fn pattern_matches(pattern: &str, dotted: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => dotted.starts_with(prefix),
        None => dotted == pattern,
    }
}

/// How elided code is detected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlaceholderPolicy {
    /// Reject `...` used anywhere other than inside a subscript
    pub reject_ellipsis: bool,
    /// Comment phrases (case-insensitive) that mark omitted code
    pub marker_phrases: Vec<String>,
}

impl Default for PlaceholderPolicy {
    fn default() -> Self {
        Self {
            reject_ellipsis: true,
            marker_phrases: vec![
                "your code here".to_string(),
                "rest of the code".to_string(),
                "rest of your code".to_string(),
                "add your code".to_string(),
                "insert code here".to_string(),
                "code goes here".to_string(),
                "same as before".to_string(),
            ],
        }
    }
}

impl PlaceholderPolicy {
    /// Only the ellipsis check, no comment markers.
    pub fn ellipsis_only() -> Self {
        Self {
            reject_ellipsis: true,
            marker_phrases: Vec::new(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            reject_ellipsis: false,
            marker_phrases: Vec::new(),
        }
    }

    pub fn marker_in(&self, comment: &str) -> Option<&str> {
        let lowered = comment.to_lowercase();
        self.marker_phrases
            .iter()
            .find(|phrase| lowered.contains(phrase.to_lowercase().as_str()))
            .map(|s| s.as_str())
    }
}

// ============================================================================
// POLICY
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationPolicy {
    /// Top-level modules code may import
    pub allowed_modules: BTreeSet<String>,
    /// Submodule prefixes refused even under an allowed root
    pub denied_submodules: Vec<String>,
    /// Module names whose use is fatal, as a chain root or as any attribute
    /// segment, and the rule it hits
    pub forbidden_modules: BTreeMap<String, RuleId>,
    /// Canonical attribute paths exempt from the segment check
    /// (`pandas.api.types` is a submodule, not the `types` module)
    pub permitted_paths: BTreeSet<String>,
    pub call_rules: Vec<CallRule>,
    /// Calls warned about and removed when they form a whole statement
    pub stripped_calls: CallRule,
    /// Dunder identifiers that may be referenced
    pub allowed_dunders: BTreeSet<String>,
    pub placeholders: PlaceholderPolicy,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self::plotting()
    }
}

impl ValidationPolicy {
    /// Rules for headless plotting code over tabular data.
    pub fn plotting() -> Self {
        let mut forbidden_modules = BTreeMap::new();
        for m in [
            "os", "posix", "nt", "subprocess", "pty", "multiprocessing", "signal", "threading",
            "concurrent",
        ] {
            forbidden_modules.insert(m.to_string(), RuleId::ProcessSpawn);
        }
        for m in [
            "socket", "ssl", "urllib", "urllib2", "urllib3", "http", "requests", "httpx", "ftplib",
            "smtplib", "telnetlib", "webbrowser", "asyncio",
        ] {
            forbidden_modules.insert(m.to_string(), RuleId::NetworkAccess);
        }
        for m in [
            "io", "pathlib", "shutil", "glob", "tempfile", "fileinput", "pickle", "shelve",
            "sqlite3", "zipfile", "tarfile",
        ] {
            forbidden_modules.insert(m.to_string(), RuleId::FileAccess);
        }
        for m in ["importlib", "runpy", "code", "codeop", "marshal"] {
            forbidden_modules.insert(m.to_string(), RuleId::DynamicEvaluation);
        }
        for m in ["sys", "builtins", "ctypes", "cffi", "gc", "inspect", "types"] {
            forbidden_modules.insert(m.to_string(), RuleId::Introspection);
        }

        Self {
            allowed_modules: set(&["matplotlib", "numpy", "pandas", "seaborn"]),
            denied_submodules: vec![
                "numpy.ctypeslib".to_string(),
                "numpy.f2py".to_string(),
                "numpy.distutils".to_string(),
                "numpy.testing".to_string(),
                "pandas.io.clipboard".to_string(),
                "matplotlib.backends".to_string(),
                "matplotlib.testing".to_string(),
            ],
            forbidden_modules,
            permitted_paths: set(&["pandas.api.types"]),
            call_rules: vec![
                CallRule::new(
                    RuleId::ProcessSpawn,
                    &[
                        "system", "popen", "Popen", "fork", "forkpty", "spawnl", "spawnle",
                        "spawnlp", "spawnv", "spawnve", "spawnvp", "posix_spawn", "execv",
                        "execve", "execl", "execlp", "execvp", "startfile", "check_output",
                        "check_call", "getoutput", "getstatusoutput", "killpg",
                    ],
                    &[],
                ),
                CallRule::new(
                    RuleId::DynamicEvaluation,
                    &[
                        "eval", "exec", "compile", "__import__", "import_module", "execfile", "reload",
                        "query",
                    ],
                    &["pandas.eval"],
                ),
                CallRule::new(
                    RuleId::FileAccess,
                    &[
                        "open", "fromfile", "tofile", "loadtxt", "genfromtxt", "savetxt", "memmap",
                        "to_csv", "to_excel", "to_json", "to_parquet", "to_pickle", "to_hdf",
                        "to_sql", "to_feather", "to_stata", "to_clipboard", "read_pickle",
                        "imread", "imsave", "rmtree", "unlink", "write_text", "write_bytes",
                        "read_text", "read_bytes", "read_csv", "read_table", "read_json",
                        "read_excel", "read_parquet", "read_fwf", "read_html", "read_xml", "read_sql",
                        "read_sql_query", "read_sql_table", "read_hdf", "read_feather", "read_orc",
                        "read_sas", "read_spss", "read_stata", "read_clipboard",
                    ],
                    &[
                        "numpy.load",
                        "numpy.save",
                        "numpy.savez",
                        "numpy.savez_compressed",
                        "pandas.read_*",
                        "matplotlib.image.*",
                    ],
                ),
                CallRule::new(
                    RuleId::NetworkAccess,
                    &[
                        "socket", "create_connection", "create_server", "socketpair", "urlopen",
                        "urlretrieve", "getaddrinfo", "gethostbyname", "load_dataset",
                    ],
                    &[],
                ),
                CallRule::new(
                    RuleId::Introspection,
                    &["getattr", "setattr", "delattr", "globals", "locals", "vars", "breakpoint"],
                    &[],
                ),
            ],
            stripped_calls: CallRule::new(
                RuleId::InteractiveDisplay,
                &[
                    "show", "ion", "ioff", "pause", "savefig", "close", "waitforbuttonpress",
                    "ginput", "get_current_fig_manager",
                ],
                &["matplotlib.use", "matplotlib.pyplot.switch_backend"],
            ),
            allowed_dunders: set(&["__name__", "__doc__", "__init__", "__len__", "__repr__", "__str__"]),
            placeholders: PlaceholderPolicy::default(),
        }
    }

    pub fn custom(base: Self) -> ValidationPolicyBuilder {
        ValidationPolicyBuilder { policy: base }
    }

    /// Whether `module` (dotted) may be imported.
    pub fn is_module_allowed(&self, module: &str) -> bool {
        let root = module.split('.').next().unwrap_or(module);
        if !self.allowed_modules.contains(root) {
            return false;
        }
        if self.is_denied_path(module) {
            return false;
        }
        let mut prefix = root.to_string();
        for segment in module.split('.').skip(1) {
            prefix = format!("{prefix}.{segment}");
            if self.forbidden_segment(segment, Some(prefix.as_str())).is_some() {
                return false;
            }
        }
        true
    }

    pub fn forbidden_root(&self, root: &str) -> Option<RuleId> {
        self.forbidden_modules.get(root).copied()
    }

    /// Rule hit by reaching `segment` as an attribute. `path` is the
    /// canonical chain up to and including it, when known.
    pub fn forbidden_segment(&self, segment: &str, path: Option<&str>) -> Option<RuleId> {
        if path.is_some_and(|p| self.permitted_paths.contains(p)) {
            return None;
        }
        self.forbidden_modules.get(segment).copied()
    }

    /// Whether a canonical dotted path lies inside a denied submodule.
    pub fn is_denied_path(&self, dotted: &str) -> bool {
        self.denied_submodules
            .iter()
            .any(|denied| dotted == denied || dotted.starts_with(&format!("{denied}.")))
    }

    /// First call rule that matches, if any.
    pub fn call_rule_for(&self, terminal: &str, dotted: Option<&str>) -> Option<RuleId> {
        self.call_rules
            .iter()
            .find(|rule| rule.matches(terminal, dotted))
            .map(|rule| rule.rule)
    }

    /// Whether a bare reference to `name` should be warned about.
    pub fn is_restricted_name(&self, name: &str) -> bool {
        self.forbidden_modules.contains_key(name)
            || self.call_rules.iter().any(|rule| rule.names.contains(name))
    }

    pub fn is_allowed_dunder(&self, name: &str) -> bool {
        self.allowed_dunders.contains(name)
    }
}

/// Builder for adjusting a base policy
pub struct ValidationPolicyBuilder {
    policy: ValidationPolicy,
}

impl ValidationPolicyBuilder {
    pub fn allow_module(mut self, module: &str) -> Self {
        self.policy.allowed_modules.insert(module.to_string());
        self
    }

    pub fn deny_submodule(mut self, module: &str) -> Self {
        self.policy.denied_submodules.push(module.to_string());
        self
    }

    pub fn forbid_module(mut self, module: &str, rule: RuleId) -> Self {
        self.policy.forbidden_modules.insert(module.to_string(), rule);
        self
    }

    pub fn call_rule(mut self, rule: CallRule) -> Self {
        self.policy.call_rules.push(rule);
        self
    }

    pub fn strip_call(mut self, name: &str) -> Self {
        self.policy.stripped_calls.names.insert(name.to_string());
        self
    }

    pub fn placeholders(mut self, placeholders: PlaceholderPolicy) -> Self {
        self.policy.placeholders = placeholders;
        self
    }

    pub fn build(self) -> ValidationPolicy {
        self.policy
    }
}
