//! Static safety analysis of submitted plotting code.
//!
//! The source is parsed with tree-sitter and walked once; findings are then
//! evaluated against a [`ValidationPolicy`]. Nothing here executes code.

use crate::errors::{Result, SandboxError};
use crate::policy::{ValidationPolicy, INJECTED_HANDLES};
use crate::types::{InjectedImport, RuleId, SyntaxDiagnostic, ValidationVerdict, ValidationWarning, Violation};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};
use tree_sitter::{Node, Parser, Tree};

const CONSTRUCT_MAX_CHARS: usize = 80;

/// Parse Python source into a syntax tree.
pub fn parse_python(source: &str) -> Result<Tree> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| SandboxError::ParserUnavailable(e.to_string()))?;
    parser
        .parse(source, None)
        .ok_or_else(|| SandboxError::ParserUnavailable("parser returned no tree".to_string()))
}

/// Checks submissions against a policy and produces the sanitized source.
#[derive(Debug, Clone, Default)]
pub struct SafetyValidator {
    policy: ValidationPolicy,
}

impl SafetyValidator {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Validate `source`. Only fails if the grammar cannot be loaded.
    pub fn validate(&self, source: &str) -> Result<ValidationVerdict> {
        if source.trim().is_empty() {
            return Ok(syntax_rejection(source, 1, 1, "empty submission"));
        }

        let tree = parse_python(source)?;
        let root = tree.root_node();

        if root.has_error() {
            let (line, column, message) = first_syntax_error(root);
            debug!("[VALIDATOR] Syntax error at {}:{}: {}", line, column, message);
            return Ok(syntax_rejection(source, line, column, &message));
        }

        let mut cursor = root.walk();
        let has_statement = root.named_children(&mut cursor).any(|n| n.kind() != "comment");
        if !has_statement {
            return Ok(syntax_rejection(source, 1, 1, "no executable statements"));
        }

        let mut walk = Walk::new(source, &self.policy);
        walk.run(root);
        let verdict = walk.finish();

        if verdict.accepted {
            debug!(
                "[VALIDATOR] Accepted ({} warnings, {} injected imports)",
                verdict.warnings.len(),
                verdict.injected_imports.len()
            );
        } else {
            info!(
                "[VALIDATOR] Rejected: {}",
                verdict
                    .violations
                    .iter()
                    .map(|v| v.rule.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        Ok(verdict)
    }
}

fn syntax_rejection(source: &str, line: usize, column: usize, message: &str) -> ValidationVerdict {
    ValidationVerdict {
        accepted: false,
        sanitized_source: source.to_string(),
        syntax_error: Some(SyntaxDiagnostic {
            line,
            column,
            message: message.to_string(),
        }),
        ..Default::default()
    }
}

fn first_syntax_error(root: Node) -> (usize, usize, String) {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_missing() {
            let pos = node.start_position();
            return (pos.row + 1, pos.column + 1, format!("missing `{}`", node.kind()));
        }
        if node.is_error() {
            let pos = node.start_position();
            return (pos.row + 1, pos.column + 1, "invalid syntax".to_string());
        }
        if !node.has_error() {
            continue;
        }
        let mut cursor = node.walk();
        let children: Vec<Node> = node.children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }
    let pos = root.start_position();
    (pos.row + 1, pos.column + 1, "invalid syntax".to_string())
}

// ============================================================================
// WALK
// ============================================================================

#[derive(Debug)]
struct Edit {
    start: usize,
    end: usize,
    replacement: &'static str,
}

#[derive(Default)]
struct Collected<'t> {
    imports: Vec<Node<'t>>,
    from_imports: Vec<Node<'t>>,
    future_imports: Vec<Node<'t>>,
    calls: Vec<Node<'t>>,
    attributes: Vec<Node<'t>>,
    identifiers: Vec<Node<'t>>,
    ellipses: Vec<Node<'t>>,
    comments: Vec<Node<'t>>,
    exec_statements: Vec<Node<'t>>,
    binding_sites: Vec<Node<'t>>,
}

struct Walk<'a> {
    source: &'a str,
    policy: &'a ValidationPolicy,
    /// Bound name to canonical dotted module path
    aliases: HashMap<String, String>,
    /// Names assigned by the code itself
    bound: HashSet<String>,
    violations: Vec<Violation>,
    warnings: Vec<ValidationWarning>,
    injected: Vec<InjectedImport>,
    edits: Vec<Edit>,
}

impl<'a> Walk<'a> {
    fn new(source: &'a str, policy: &'a ValidationPolicy) -> Self {
        let aliases = INJECTED_HANDLES
            .iter()
            .map(|(name, module)| (name.to_string(), module.to_string()))
            .collect();
        Self {
            source,
            policy,
            aliases,
            bound: HashSet::new(),
            violations: Vec::new(),
            warnings: Vec::new(),
            injected: Vec::new(),
            edits: Vec::new(),
        }
    }

    fn run(&mut self, root: Node) {
        let collected = self.collect(root);

        for node in &collected.binding_sites {
            self.record_bindings(*node);
        }
        for node in &collected.future_imports {
            self.edits.push(removal_edit(self.source, *node));
        }
        for node in &collected.imports {
            self.visit_import(*node);
        }
        for node in &collected.from_imports {
            self.visit_from_import(*node);
        }
        for node in &collected.exec_statements {
            self.violation(RuleId::DynamicEvaluation, *node, "exec statement evaluates code dynamically");
        }
        for node in &collected.calls {
            self.visit_call(*node);
        }
        for node in &collected.attributes {
            self.visit_attribute(*node);
        }
        for node in &collected.identifiers {
            self.visit_identifier(*node);
        }
        for node in &collected.ellipses {
            self.visit_ellipsis(*node);
        }
        for node in &collected.comments {
            self.visit_comment(*node);
        }
    }

    fn collect<'t>(&self, root: Node<'t>) -> Collected<'t> {
        let mut out = Collected::default();
        let mut stack = vec![(root, false)];
        while let Some((node, in_import)) = stack.pop() {
            let kind = node.kind();
            let in_import = in_import
                || matches!(kind, "import_statement" | "import_from_statement" | "future_import_statement");
            match kind {
                "import_statement" => out.imports.push(node),
                "import_from_statement" => out.from_imports.push(node),
                "future_import_statement" => out.future_imports.push(node),
                "call" => out.calls.push(node),
                "attribute" if !in_import => out.attributes.push(node),
                "identifier" if !in_import => out.identifiers.push(node),
                "ellipsis" => out.ellipses.push(node),
                "comment" => out.comments.push(node),
                "exec_statement" => out.exec_statements.push(node),
                "assignment" | "augmented_assignment" | "for_statement" | "for_in_clause"
                | "named_expression" | "function_definition" | "class_definition" | "as_pattern"
                | "parameters" | "lambda_parameters" => out.binding_sites.push(node),
                _ => {}
            }
            let mut cursor = node.walk();
            let children: Vec<Node> = node.children(&mut cursor).collect();
            stack.extend(children.into_iter().rev().map(|c| (c, in_import)));
        }
        out
    }

    fn text(&self, node: Node) -> &'a str {
        node.utf8_text(self.source.as_bytes()).unwrap_or("")
    }

    fn construct(&self, node: Node) -> String {
        let text = self.text(node);
        let first_line = text.lines().next().unwrap_or("");
        if first_line.chars().count() > CONSTRUCT_MAX_CHARS {
            let cut: String = first_line.chars().take(CONSTRUCT_MAX_CHARS).collect();
            format!("{cut}...")
        } else {
            first_line.to_string()
        }
    }

    fn violation(&mut self, rule: RuleId, node: Node, message: impl Into<String>) {
        let construct = self.construct(node);
        self.violation_with(rule, construct, node, message);
    }

    fn violation_with(&mut self, rule: RuleId, construct: String, node: Node, message: impl Into<String>) {
        let line = node.start_position().row + 1;
        if self
            .violations
            .iter()
            .any(|v| v.rule == rule && v.line == line && v.construct == construct)
        {
            return;
        }
        self.violations.push(Violation {
            rule,
            construct,
            message: message.into(),
            line,
        });
    }

    fn warning(&mut self, rule: RuleId, node: Node, message: impl Into<String>) {
        let construct = self.construct(node);
        let line = node.start_position().row + 1;
        if self
            .warnings
            .iter()
            .any(|w| w.rule == rule && w.line == line && w.construct == construct)
        {
            return;
        }
        self.warnings.push(ValidationWarning {
            rule,
            construct,
            message: message.into(),
            line,
        });
    }

    /// Rewrite the root of a dotted chain through import aliases.
    fn canonical(&self, chain: &str) -> String {
        let (root, rest) = match chain.split_once('.') {
            Some((root, rest)) => (root, Some(rest)),
            None => (chain, None),
        };
        match (self.aliases.get(root), rest) {
            (Some(target), Some(rest)) => format!("{target}.{rest}"),
            (Some(target), None) => target.clone(),
            (None, _) => chain.to_string(),
        }
    }

    // ------------------------------------------------------------------------
    // Imports
    // ------------------------------------------------------------------------

    fn visit_import(&mut self, node: Node) {
        let mut cursor = node.walk();
        let names: Vec<Node> = node.children_by_field_name("name", &mut cursor).collect();
        let mut pending = Vec::new();
        let mut all_allowed = true;

        for name in names {
            let (module, alias) = match name.kind() {
                "aliased_import" => (
                    name.child_by_field_name("name").map(|n| self.text(n)).unwrap_or(""),
                    name.child_by_field_name("alias").map(|n| self.text(n)),
                ),
                _ => (self.text(name), None),
            };
            let root = module.split('.').next().unwrap_or(module);
            let (bind_as, target) = match alias {
                Some(alias) => (alias, module),
                None => (root, root),
            };
            self.aliases.insert(bind_as.to_string(), target.to_string());

            if self.policy.is_module_allowed(module) {
                pending.push(InjectedImport {
                    module: module.to_string(),
                    member: None,
                    bind_as: bind_as.to_string(),
                });
            } else {
                all_allowed = false;
                self.violation_with(
                    RuleId::DisallowedImport,
                    module.to_string(),
                    name,
                    format!("import of '{module}' is not allowed"),
                );
            }
        }

        if all_allowed {
            self.injected.extend(pending);
            self.edits.push(removal_edit(self.source, node));
        }
    }

    fn visit_from_import(&mut self, node: Node) {
        let Some(module_node) = node.child_by_field_name("module_name") else {
            return;
        };
        if module_node.kind() == "relative_import" {
            self.violation(RuleId::RelativeImport, module_node, "relative imports are not allowed");
            return;
        }
        let module = self.text(module_node);
        let module_allowed = self.policy.is_module_allowed(module);
        if !module_allowed {
            self.violation_with(
                RuleId::DisallowedImport,
                module.to_string(),
                module_node,
                format!("import from '{module}' is not allowed"),
            );
        }

        let mut cursor = node.walk();
        let names: Vec<Node> = node.children_by_field_name("name", &mut cursor).collect();
        let mut pending = Vec::new();
        let mut all_allowed = module_allowed;

        for name in names {
            let (member, alias) = match name.kind() {
                "aliased_import" => (
                    name.child_by_field_name("name").map(|n| self.text(n)).unwrap_or(""),
                    name.child_by_field_name("alias").map(|n| self.text(n)),
                ),
                _ => (self.text(name), None),
            };
            let full = format!("{module}.{member}");
            let bind_as = alias.unwrap_or(member);
            self.aliases.insert(bind_as.to_string(), full.clone());

            if !module_allowed {
                continue;
            }
            if member.starts_with("__") || !self.policy.is_module_allowed(&full) {
                all_allowed = false;
                self.violation_with(
                    RuleId::DisallowedImport,
                    full.clone(),
                    name,
                    format!("import of '{full}' is not allowed"),
                );
                continue;
            }
            pending.push(InjectedImport {
                module: module.to_string(),
                member: Some(member.to_string()),
                bind_as: bind_as.to_string(),
            });
        }

        let mut cursor = node.walk();
        let wildcard = node.children(&mut cursor).any(|c| c.kind() == "wildcard_import");
        if wildcard && module_allowed {
            pending.push(InjectedImport {
                module: module.to_string(),
                member: None,
                bind_as: "*".to_string(),
            });
        }

        if all_allowed {
            self.injected.extend(pending);
            self.edits.push(removal_edit(self.source, node));
        }
    }

    // ------------------------------------------------------------------------
    // Calls and references
    // ------------------------------------------------------------------------

    fn visit_call(&mut self, node: Node) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        let terminal = match function.kind() {
            "identifier" => self.text(function),
            "attribute" => function
                .child_by_field_name("attribute")
                .map(|n| self.text(n))
                .unwrap_or(""),
            _ => return,
        };
        let raw_chain = dotted_chain(function, self.source);
        let dotted = raw_chain.as_deref().map(|c| self.canonical(c));

        if self.policy.stripped_calls.matches(terminal, dotted.as_deref()) {
            self.warning(
                RuleId::InteractiveDisplay,
                function,
                format!("'{terminal}' has no effect in headless rendering and was removed"),
            );
            if let Some(statement) = standalone_statement(node) {
                self.edits.push(removal_edit(self.source, statement));
            }
            return;
        }

        if let Some(rule) = self.policy.call_rule_for(terminal, dotted.as_deref()) {
            let shown = dotted.clone().unwrap_or_else(|| terminal.to_string());
            self.violation_with(rule, shown.clone(), function, format!("call to '{shown}' is not allowed"));
            return;
        }

        if let (Some(raw), Some(dotted)) = (raw_chain.as_deref(), dotted.as_deref()) {
            let raw_root = raw.split('.').next().unwrap_or(raw);
            let root = dotted.split('.').next().unwrap_or(dotted);
            if self.bound.contains(raw_root) {
                return;
            }
            if let Some(rule) = self.policy.forbidden_root(root) {
                self.violation_with(
                    rule,
                    dotted.to_string(),
                    function,
                    format!("use of module '{root}' is not allowed"),
                );
            }
        }
    }

    /// Every attribute node is visited, so each segment of a chain and each
    /// prefix of its canonical path gets checked once. Local bindings only
    /// exempt the root identifier, never a segment reached through it.
    fn visit_attribute(&mut self, node: Node) {
        let Some(attr) = node.child_by_field_name("attribute") else {
            return;
        };
        let name = self.text(attr);
        if is_dunder(name) && !self.policy.is_allowed_dunder(name) {
            self.violation_with(
                RuleId::Introspection,
                name.to_string(),
                attr,
                format!("access to '{name}' is not allowed"),
            );
            return;
        }

        let path = dotted_chain(node, self.source).map(|chain| self.canonical(&chain));
        if let Some(rule) = self.policy.forbidden_segment(name, path.as_deref()) {
            let shown = path.clone().unwrap_or_else(|| name.to_string());
            self.violation_with(rule, shown, attr, format!("use of module '{name}' is not allowed"));
            return;
        }
        if let Some(path) = path {
            if self.policy.is_denied_path(&path) {
                self.violation_with(
                    RuleId::DisallowedImport,
                    path.clone(),
                    attr,
                    format!("use of module '{path}' is not allowed"),
                );
            }
        }
    }

    fn visit_identifier(&mut self, node: Node) {
        if let Some(parent) = node.parent() {
            match parent.kind() {
                "attribute" if is_field(parent, "attribute", node) => return,
                "keyword_argument" if is_field(parent, "name", node) => return,
                _ => {}
            }
        }
        let name = self.text(node);

        if is_dunder(name) && !self.policy.is_allowed_dunder(name) {
            self.violation(RuleId::Introspection, node, format!("reference to '{name}' is not allowed"));
            return;
        }

        if self.bound.contains(name) || in_call_target(node) {
            return;
        }
        if self.policy.is_restricted_name(name) {
            self.warning(
                RuleId::RestrictedReference,
                node,
                format!("reference to restricted name '{name}'"),
            );
        }
    }

    fn visit_ellipsis(&mut self, node: Node) {
        if !self.policy.placeholders.reject_ellipsis || inside_subscript(node) {
            return;
        }
        self.violation(
            RuleId::Placeholder,
            node,
            "'...' placeholder indicates incomplete code",
        );
    }

    fn visit_comment(&mut self, node: Node) {
        let text = self.text(node);
        if let Some(marker) = self.policy.placeholders.marker_in(text) {
            let message = format!("comment '{marker}' indicates omitted code");
            self.violation(RuleId::Placeholder, node, message);
        }
    }

    fn record_bindings(&mut self, site: Node) {
        let targets: Vec<Node> = match site.kind() {
            "assignment" | "augmented_assignment" | "for_statement" | "for_in_clause" => {
                site.child_by_field_name("left").into_iter().collect()
            }
            "named_expression" | "function_definition" | "class_definition" => {
                site.child_by_field_name("name").into_iter().collect()
            }
            "as_pattern" => site.child_by_field_name("alias").into_iter().collect(),
            _ => {
                let mut cursor = site.walk();
                site.named_children(&mut cursor).collect()
            }
        };

        let mut stack = targets;
        while let Some(node) = stack.pop() {
            match node.kind() {
                "identifier" => {
                    let name = self.text(node).to_string();
                    self.bound.insert(name);
                }
                "default_parameter" | "typed_default_parameter" => {
                    stack.extend(node.child_by_field_name("name"));
                }
                "typed_parameter" => {
                    stack.extend(node.named_child(0));
                }
                "pattern_list" | "tuple_pattern" | "list_pattern" | "tuple" | "list"
                | "list_splat_pattern" | "dictionary_splat_pattern" | "as_pattern_target"
                | "parenthesized_expression" | "expression_list" => {
                    let mut cursor = node.walk();
                    let children: Vec<Node> = node.named_children(&mut cursor).collect();
                    stack.extend(children);
                }
                _ => {}
            }
        }
    }

    fn finish(mut self) -> ValidationVerdict {
        let accepted = self.violations.is_empty();
        let sanitized_source = apply_edits(self.source, &mut self.edits);
        ValidationVerdict {
            accepted,
            sanitized_source,
            violations: self.violations,
            warnings: self.warnings,
            syntax_error: None,
            injected_imports: self.injected,
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

fn is_field(parent: Node, field: &str, child: Node) -> bool {
    parent
        .child_by_field_name(field)
        .map(|n| n.id() == child.id())
        .unwrap_or(false)
}

/// `a.b.c` for an identifier or attribute chain; `None` when the chain is
/// rooted in anything else (a call, a subscript).
fn dotted_chain(node: Node, source: &str) -> Option<String> {
    let mut segments = Vec::new();
    let mut current = node;
    loop {
        match current.kind() {
            "identifier" => {
                segments.push(current.utf8_text(source.as_bytes()).ok()?);
                break;
            }
            "attribute" => {
                let attr = current.child_by_field_name("attribute")?;
                segments.push(attr.utf8_text(source.as_bytes()).ok()?);
                current = current.child_by_field_name("object")?;
            }
            _ => return None,
        }
    }
    segments.reverse();
    Some(segments.join("."))
}

/// True when `node` is the root identifier of a call target chain.
fn in_call_target(node: Node) -> bool {
    let mut current = node;
    while let Some(parent) = current.parent() {
        match parent.kind() {
            "attribute" if is_field(parent, "object", current) => current = parent,
            "call" => return is_field(parent, "function", current),
            _ => return false,
        }
    }
    false
}

fn inside_subscript(node: Node) -> bool {
    let mut current = node;
    while let Some(parent) = current.parent() {
        if parent.kind() == "subscript" {
            let in_value = parent
                .child_by_field_name("value")
                .map(|v| node.start_byte() >= v.start_byte() && node.end_byte() <= v.end_byte())
                .unwrap_or(false);
            if !in_value {
                return true;
            }
        }
        current = parent;
    }
    false
}

/// The expression statement a call forms on its own, if any.
fn standalone_statement(call: Node) -> Option<Node> {
    let parent = call.parent()?;
    if parent.kind() == "expression_statement" && parent.named_child_count() == 1 {
        Some(parent)
    } else {
        None
    }
}

/// Remove a statement. Whole-line top-level statements lose their lines;
/// anything else becomes `pass` so blocks and `;` chains stay valid.
fn removal_edit(source: &str, statement: Node) -> Edit {
    let start = statement.start_byte();
    let end = statement.end_byte();
    let top_level = statement
        .parent()
        .map(|p| p.kind() == "module")
        .unwrap_or(false);

    let line_start = source[..start].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let line_end = source[end..]
        .find('\n')
        .map(|i| end + i + 1)
        .unwrap_or(source.len());
    let before = source[line_start..start].trim();
    let after = source[end..line_end].trim();

    if top_level && before.is_empty() && (after.is_empty() || after.starts_with('#')) {
        Edit {
            start: line_start,
            end: line_end,
            replacement: "",
        }
    } else {
        Edit {
            start,
            end,
            replacement: "pass",
        }
    }
}

fn apply_edits(source: &str, edits: &mut [Edit]) -> String {
    edits.sort_by_key(|e| (e.start, e.end));
    let mut out = String::with_capacity(source.len());
    let mut cursor = 0;
    for edit in edits.iter() {
        if edit.start < cursor {
            continue;
        }
        out.push_str(&source[cursor..edit.start]);
        out.push_str(edit.replacement);
        cursor = edit.end;
    }
    out.push_str(&source[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PlaceholderPolicy;

    fn validate(source: &str) -> ValidationVerdict {
        SafetyValidator::default().validate(source).unwrap()
    }

    fn rules(verdict: &ValidationVerdict) -> Vec<RuleId> {
        verdict.violations.iter().map(|v| v.rule).collect()
    }

    #[test]
    fn test_clean_plot_is_accepted() {
        let source = "import matplotlib.pyplot as plt\nimport numpy as np\n\nx = np.linspace(0, 10, 50)\nplt.plot(x, np.sin(x))\nplt.title('Wave')\n";
        let verdict = validate(source);
        assert!(verdict.accepted, "{:?}", verdict.violations);
        assert!(verdict.warnings.is_empty());
        assert!(!verdict.sanitized_source.contains("import"));
        assert!(verdict.sanitized_source.contains("plt.plot(x, np.sin(x))"));
        assert_eq!(verdict.injected_imports.len(), 2);
        assert_eq!(verdict.injected_imports[0].module, "matplotlib.pyplot");
        assert_eq!(verdict.injected_imports[0].bind_as, "plt");
    }

    #[test]
    fn test_empty_source_is_syntax_error() {
        for source in ["", "   \n\t\n"] {
            let verdict = validate(source);
            assert!(!verdict.accepted);
            assert_eq!(verdict.rejection_status(), Some(crate::types::ExecutionStatus::SyntaxError));
        }
    }

    #[test]
    fn test_comment_only_is_syntax_error() {
        let verdict = validate("# just a note\n");
        assert!(verdict.syntax_error.is_some());
    }

    #[test]
    fn test_unbalanced_paren_is_syntax_error() {
        let verdict = validate("plt.plot([1, 2, 3]\nplt.title('x')\n");
        let diag = verdict.syntax_error.expect("syntax error expected");
        assert!(diag.line >= 1);
        assert!(verdict.violations.is_empty());
    }

    #[test]
    fn test_disallowed_import_and_call() {
        let verdict = validate("import os\nos.system('rm -rf /')\n");
        assert!(!verdict.accepted);
        let rules = rules(&verdict);
        assert!(rules.contains(&RuleId::DisallowedImport));
        assert!(rules.contains(&RuleId::ProcessSpawn));
        assert!(verdict.violations.iter().any(|v| v.construct == "os.system"));
        assert!(verdict
            .violations
            .iter()
            .any(|v| v.rule == RuleId::DisallowedImport && v.construct == "os"));
    }

    #[test]
    fn test_forbidden_module_reached_through_allowed_handle() {
        let cases = [
            ("matplotlib.subprocess.run(['sh', '-c', 'id'])\n", RuleId::ProcessSpawn, "matplotlib.subprocess"),
            ("plt.sys.modules['subprocess'].run(['id'])\n", RuleId::Introspection, "matplotlib.pyplot.sys"),
            ("import pandas as pd\npd.io.common.os.remove('/tmp/x')\n", RuleId::ProcessSpawn, "pandas.io.common.os"),
        ];
        for (source, rule, construct) in cases {
            let verdict = validate(source);
            assert!(!verdict.accepted, "{source}");
            assert!(
                verdict.violations.iter().any(|v| v.rule == rule && v.construct == construct),
                "{source}: {:?}",
                verdict.violations
            );
        }
    }

    #[test]
    fn test_io_segment_under_pandas_is_file_access() {
        let verdict = validate("frames = pd.io.common\n");
        assert_eq!(rules(&verdict), vec![RuleId::FileAccess]);
        assert_eq!(verdict.violations[0].construct, "pandas.io");
    }

    #[test]
    fn test_denied_submodule_reached_by_attribute() {
        let verdict = validate("lib = np.ctypeslib.load_library('libc', '/lib')\n");
        assert!(!verdict.accepted);
        assert!(verdict
            .violations
            .iter()
            .any(|v| v.rule == RuleId::DisallowedImport && v.construct == "numpy.ctypeslib"));
    }

    #[test]
    fn test_local_binding_does_not_exempt_segments() {
        let verdict = validate("m = matplotlib\nm.subprocess.run(['id'])\n");
        assert!(rules(&verdict).contains(&RuleId::ProcessSpawn));
    }

    #[test]
    fn test_pandas_api_types_is_permitted() {
        let verdict = validate("if pd.api.types.is_numeric_dtype(df_sales['revenue']):\n    plt.plot(df_sales['revenue'])\n");
        assert!(verdict.accepted, "{:?}", verdict.violations);
    }

    #[test]
    fn test_nested_pandas_readers_are_file_access() {
        let verdict = validate("t = pd.io.parsers.read_csv('/etc/passwd', sep=':', header=None)\nplt.plot(t[2])\n");
        assert!(verdict
            .violations
            .iter()
            .any(|v| v.rule == RuleId::FileAccess && v.construct == "pandas.io.parsers.read_csv"));

        let verdict = validate("j = pd.io.json.read_json('/etc/hosts')\n");
        assert!(verdict
            .violations
            .iter()
            .any(|v| v.rule == RuleId::FileAccess && v.construct == "pandas.io.json.read_json"));
    }

    #[test]
    fn test_query_string_is_dynamic_evaluation() {
        let verdict = validate("subset = df_sales.query('revenue > 1')\nplt.plot(subset['revenue'])\n");
        assert_eq!(rules(&verdict), vec![RuleId::DynamicEvaluation]);
        assert_eq!(verdict.violations[0].construct, "df_sales.query");
    }

    #[test]
    fn test_aliased_forbidden_module_is_resolved() {
        let verdict = validate("import subprocess as sp\nsp.run(['ls'])\n");
        assert!(verdict
            .violations
            .iter()
            .any(|v| v.rule == RuleId::ProcessSpawn && v.construct == "subprocess.run"));
    }

    #[test]
    fn test_nested_call_is_found() {
        let source = "def helper():\n    if True:\n        return [open('/etc/passwd')]\n\nplt.plot([1, 2])\n";
        let verdict = validate(source);
        assert_eq!(rules(&verdict), vec![RuleId::FileAccess]);
        assert_eq!(verdict.violations[0].line, 3);
    }

    #[test]
    fn test_read_functions_rejected_through_alias() {
        let verdict = validate("import pandas as p\ndata = p.read_csv('/etc/shadow')\n");
        assert_eq!(rules(&verdict), vec![RuleId::FileAccess]);
        assert_eq!(verdict.violations[0].construct, "pandas.read_csv");
    }

    #[test]
    fn test_dynamic_evaluation() {
        let verdict = validate("x = eval('1 + 1')\ny = df.eval('a + b')\n");
        assert_eq!(rules(&verdict), vec![RuleId::DynamicEvaluation, RuleId::DynamicEvaluation]);
    }

    #[test]
    fn test_dunder_escape_is_rejected() {
        let verdict = validate("classes = ().__class__.__bases__[0].__subclasses__()\n");
        assert!(!verdict.accepted);
        assert!(rules(&verdict).iter().all(|r| *r == RuleId::Introspection));
    }

    #[test]
    fn test_main_guard_is_allowed() {
        let verdict = validate("def main():\n    plt.plot([1, 2])\n\nif __name__ == '__main__':\n    main()\n");
        assert!(verdict.accepted, "{:?}", verdict.violations);
    }

    #[test]
    fn test_network_calls() {
        let verdict = validate("import socket\ns = socket.create_connection(('example.com', 80))\n");
        assert!(rules(&verdict).contains(&RuleId::NetworkAccess));
        let verdict = validate("tips = sns.load_dataset('tips')\n");
        assert_eq!(rules(&verdict), vec![RuleId::NetworkAccess]);
    }

    #[test]
    fn test_relative_import() {
        let verdict = validate("from . import secrets\n");
        assert_eq!(rules(&verdict), vec![RuleId::RelativeImport]);
    }

    #[test]
    fn test_denied_submodule_from_import() {
        let verdict = validate("from numpy import ctypeslib\n");
        assert_eq!(rules(&verdict), vec![RuleId::DisallowedImport]);
    }

    #[test]
    fn test_forbidden_module_imported_from_allowed_package() {
        let verdict = validate("from matplotlib import subprocess\nsubprocess.run(['id'])\n");
        assert!(verdict
            .violations
            .iter()
            .any(|v| v.rule == RuleId::DisallowedImport && v.construct == "matplotlib.subprocess"));
    }

    #[test]
    fn test_from_import_is_injected() {
        let verdict = validate("from matplotlib import pyplot as p\np.plot([1, 2])\n");
        assert!(verdict.accepted);
        assert_eq!(
            verdict.injected_imports,
            vec![InjectedImport {
                module: "matplotlib".into(),
                member: Some("pyplot".into()),
                bind_as: "p".into(),
            }]
        );
        assert_eq!(verdict.sanitized_source, "p.plot([1, 2])\n");
    }

    #[test]
    fn test_placeholder_ellipsis() {
        let verdict = validate("def prepare(data):\n    ...\n\nplt.plot([1, 2])\n");
        assert_eq!(rules(&verdict), vec![RuleId::Placeholder]);
    }

    #[test]
    fn test_ellipsis_in_subscript_is_allowed() {
        let verdict = validate("grid = np.zeros((3, 3))\nrow = grid[..., 0]\nplt.plot(row)\n");
        assert!(verdict.accepted, "{:?}", verdict.violations);
    }

    #[test]
    fn test_placeholder_comment() {
        let verdict = validate("plt.plot([1, 2])\n# ... rest of the code\n");
        assert_eq!(rules(&verdict), vec![RuleId::Placeholder]);

        let lenient = SafetyValidator::new(
            ValidationPolicy::custom(ValidationPolicy::plotting())
                .placeholders(PlaceholderPolicy::ellipsis_only())
                .build(),
        );
        assert!(lenient.validate("plt.plot([1, 2])\n# rest of the code\n").unwrap().accepted);
    }

    #[test]
    fn test_interactive_calls_are_warned_and_stripped() {
        let source = "plt.plot([1, 2])\nplt.show()\nif True:\n    plt.savefig('out.png')\n";
        let verdict = validate(source);
        assert!(verdict.accepted);
        assert_eq!(verdict.warnings.len(), 2);
        assert!(verdict.warnings.iter().all(|w| w.rule == RuleId::InteractiveDisplay));
        assert_eq!(verdict.sanitized_source, "plt.plot([1, 2])\nif True:\n    pass\n");
    }

    #[test]
    fn test_stripping_inside_semicolon_chain() {
        let verdict = validate("import numpy as np; x = np.arange(3)\nplt.plot(x); plt.show()\n");
        assert!(verdict.accepted);
        assert_eq!(verdict.sanitized_source, "pass; x = np.arange(3)\nplt.plot(x); pass\n");
    }

    #[test]
    fn test_restricted_reference_is_warning() {
        let verdict = validate("handler = print\nthing = open\nplt.plot([1])\n");
        assert!(verdict.accepted);
        assert_eq!(verdict.warnings.len(), 1);
        assert_eq!(verdict.warnings[0].rule, RuleId::RestrictedReference);
        assert_eq!(verdict.warnings[0].construct, "open");
    }

    #[test]
    fn test_local_variable_shadowing_module_name() {
        let verdict = validate("signal = np.sin(np.linspace(0, 1, 10))\nplt.plot(signal.cumsum())\n");
        assert!(verdict.accepted, "{:?}", verdict.violations);
    }

    #[test]
    fn test_sanitized_source_has_no_disallowed_patterns() {
        let source = "import numpy as np\nimport matplotlib.pyplot as plt\nplt.bar(['a', 'b'], [1, 2])\nplt.show()\n";
        let verdict = validate(source);
        assert!(verdict.accepted);
        let reparsed = validate(&verdict.sanitized_source);
        assert!(reparsed.accepted);
        assert!(reparsed.warnings.is_empty());
        assert!(reparsed.injected_imports.is_empty());
    }

    #[test]
    fn test_validation_is_pure() {
        let source = "import os\nos.listdir('.')\n";
        let first = validate(source);
        let second = validate(source);
        assert_eq!(first.violations, second.violations);
        assert_eq!(first.sanitized_source, second.sanitized_source);
    }
}
