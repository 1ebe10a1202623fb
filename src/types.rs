//! Request and result types shared by every stage of a render.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// SUBMISSION
// ============================================================================

/// A dataset file paired with the identifier it is exposed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasBinding {
    pub alias: String,
    pub path: PathBuf,
}

/// Per-run knobs supplied alongside the code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    /// Wall-clock budget, measured from worker spawn
    pub timeout_seconds: u64,
    /// Address-space ceiling for the worker; 0 means unlimited
    pub memory_cap_bytes: u64,
    /// Apply the publication style to the figure before saving
    pub enforce_style_policy: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: 8,
            memory_cap_bytes: 0,
            enforce_style_policy: false,
        }
    }
}

impl ExecutionOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }

    pub fn has_memory_cap(&self) -> bool {
        self.memory_cap_bytes > 0
    }
}

/// One render request. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSubmission {
    id: Uuid,
    source: String,
    bindings: Vec<AliasBinding>,
    options: ExecutionOptions,
}

impl CodeSubmission {
    pub fn new(source: impl Into<String>, bindings: Vec<AliasBinding>, options: ExecutionOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            bindings,
            options,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn bindings(&self) -> &[AliasBinding] {
        &self.bindings
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }
}

// ============================================================================
// VALIDATION
// ============================================================================

/// Identifies which rule a finding came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    DisallowedImport,
    RelativeImport,
    ProcessSpawn,
    DynamicEvaluation,
    FileAccess,
    NetworkAccess,
    Introspection,
    Placeholder,
    InteractiveDisplay,
    RestrictedReference,
}

impl RuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::DisallowedImport => "disallowed_import",
            RuleId::RelativeImport => "relative_import",
            RuleId::ProcessSpawn => "process_spawn",
            RuleId::DynamicEvaluation => "dynamic_evaluation",
            RuleId::FileAccess => "file_access",
            RuleId::NetworkAccess => "network_access",
            RuleId::Introspection => "introspection",
            RuleId::Placeholder => "placeholder",
            RuleId::InteractiveDisplay => "interactive_display",
            RuleId::RestrictedReference => "restricted_reference",
        }
    }
}

/// A fatal finding. Any violation rejects the submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: RuleId,
    /// The offending construct as written, e.g. `os.system`
    pub construct: String,
    pub message: String,
    /// 1-based source line
    pub line: usize,
}

/// A non-fatal finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub rule: RuleId,
    pub construct: String,
    pub message: String,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxDiagnostic {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

/// An approved import the worker performs on the code's behalf after the
/// statement itself was stripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectedImport {
    /// Module to import, e.g. `matplotlib.pyplot`
    pub module: String,
    /// Member pulled out of the module for `from m import member`
    pub member: Option<String>,
    /// Name bound in the user namespace; `*` for a wildcard import
    pub bind_as: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub accepted: bool,
    pub sanitized_source: String,
    pub violations: Vec<Violation>,
    pub warnings: Vec<ValidationWarning>,
    pub syntax_error: Option<SyntaxDiagnostic>,
    pub injected_imports: Vec<InjectedImport>,
}

impl ValidationVerdict {
    /// Status to report when the verdict stops the pipeline.
    pub fn rejection_status(&self) -> Option<ExecutionStatus> {
        if self.syntax_error.is_some() {
            Some(ExecutionStatus::SyntaxError)
        } else if !self.accepted {
            Some(ExecutionStatus::SafetyRejected)
        } else {
            None
        }
    }

    /// Human-readable summary of why the verdict rejects.
    pub fn rejection_summary(&self) -> Option<String> {
        if let Some(diag) = &self.syntax_error {
            return Some(format!(
                "syntax error at line {}, column {}: {}",
                diag.line, diag.column, diag.message
            ));
        }
        if self.accepted {
            return None;
        }
        let rules: Vec<String> = self
            .violations
            .iter()
            .map(|v| format!("{} ({}, line {})", v.rule.as_str(), v.construct, v.line))
            .collect();
        Some(format!("rejected by safety rules: {}", rules.join("; ")))
    }
}

// ============================================================================
// RESULT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    SyntaxError,
    SafetyRejected,
    RuntimeError,
    Timeout,
    ResourceExceeded,
    InternalError,
    /// Forcibly terminated by a cancellation signal
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::SyntaxError => "syntax_error",
            ExecutionStatus::SafetyRejected => "safety_rejected",
            ExecutionStatus::RuntimeError => "runtime_error",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::ResourceExceeded => "resource_exceeded",
            ExecutionStatus::InternalError => "internal_error",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

/// Output encoding of the rendered artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    #[default]
    Png,
    Svg,
    Pdf,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Svg => "svg",
            ImageFormat::Pdf => "pdf",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Title,
    XLabel,
    YLabel,
    Legend,
}

/// Normalized rectangle in figure-fraction units, origin at bottom-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    /// Same box expressed with a top-left origin.
    pub fn flipped_vertical(&self) -> Self {
        Self {
            x: self.x,
            y: (1.0 - self.y - self.height).clamp(0.0, 1.0),
            width: self.width,
            height: self.height,
        }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x && x <= self.x + self.width && y >= self.y && y <= self.y + self.height
    }
}

/// A text element of the rendered figure that a UI can make editable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionElement {
    pub kind: ElementKind,
    pub text: String,
    pub bbox: BoundingBox,
    /// Subplot the element belongs to; `None` for figure-level text
    pub axes_index: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub submission_id: Option<Uuid>,
    pub status: ExecutionStatus,
    #[serde(with = "base64_bytes", default)]
    pub artifact: Option<Vec<u8>>,
    pub artifact_format: Option<ImageFormat>,
    pub elements: Vec<InteractionElement>,
    pub diagnostic: Option<String>,
    pub violations: Vec<Violation>,
    pub warnings: Vec<String>,
    pub wall_time_ms: u64,
}

impl ExecutionResult {
    pub fn success(artifact: Vec<u8>, format: ImageFormat, elements: Vec<InteractionElement>) -> Self {
        Self {
            submission_id: None,
            status: ExecutionStatus::Success,
            artifact: Some(artifact),
            artifact_format: Some(format),
            elements,
            diagnostic: None,
            violations: Vec::new(),
            warnings: Vec::new(),
            wall_time_ms: 0,
        }
    }

    pub fn failure(status: ExecutionStatus, diagnostic: impl Into<String>) -> Self {
        debug_assert!(status != ExecutionStatus::Success);
        Self {
            submission_id: None,
            status,
            artifact: None,
            artifact_format: None,
            elements: Vec::new(),
            diagnostic: Some(diagnostic.into()),
            violations: Vec::new(),
            warnings: Vec::new(),
            wall_time_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn with_submission(mut self, id: Uuid) -> Self {
        self.submission_id = Some(id);
        self
    }

    pub fn with_wall_time(mut self, elapsed: Duration) -> Self {
        self.wall_time_ms = elapsed.as_millis() as u64;
        self
    }

    pub fn with_violations(mut self, violations: Vec<Violation>) -> Self {
        self.violations = violations;
        self
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
