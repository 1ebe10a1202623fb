//! Replies from the code-generating collaborator.

use crate::types::{AliasBinding, CodeSubmission, ExecutionOptions};
use serde::{Deserialize, Serialize};

/// One reply per turn. Only `Plot` carries code toward execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantReply {
    Plot {
        code: String,
        /// Prose accompanying the code
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Clarification {
        question: String,
    },
    Text {
        text: String,
    },
    Error {
        message: String,
    },
}

impl AssistantReply {
    /// Classify raw model output: a fenced code block makes it a plot reply,
    /// anything else is plain text.
    pub fn from_model_output(output: &str) -> Self {
        match extract_code_block(output) {
            Some(code) => AssistantReply::Plot {
                code,
                text: prose_outside_fences(output),
            },
            None => AssistantReply::Text {
                text: output.trim().to_string(),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AssistantReply::Plot { .. } => "plot",
            AssistantReply::Clarification { .. } => "clarification",
            AssistantReply::Text { .. } => "text",
            AssistantReply::Error { .. } => "error",
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            AssistantReply::Plot { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn into_submission(self, bindings: Vec<AliasBinding>, options: ExecutionOptions) -> Option<CodeSubmission> {
        match self {
            AssistantReply::Plot { code, .. } => Some(CodeSubmission::new(code, bindings, options)),
            _ => None,
        }
    }
}

/// First fenced block, preferring one tagged `python`. A short language tag
/// on the opening fence is dropped.
pub fn extract_code_block(text: &str) -> Option<String> {
    let body = if let Some((_, rest)) = text.split_once("```python") {
        rest.split("```").next()?.to_string()
    } else {
        let mut parts = text.split("```");
        parts.next()?;
        let inner = parts.next()?;
        // An unterminated fence is not a block
        parts.next()?;
        match inner.split_once('\n') {
            Some((tag, rest)) if is_language_tag(tag) => rest.to_string(),
            _ => inner.to_string(),
        }
    };

    let code = body.trim_matches('\n').to_string();
    (!code.trim().is_empty()).then_some(code)
}

fn is_language_tag(line: &str) -> bool {
    let tag = line.trim();
    !tag.is_empty() && !tag.contains([' ', '(', '=', '#'])
}

fn prose_outside_fences(text: &str) -> Option<String> {
    let prose: Vec<&str> = text
        .split("```")
        .step_by(2)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    (!prose.is_empty()).then(|| prose.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_fence_becomes_plot() {
        let output = "Here you go:\n```python\nplt.plot([1, 2])\nplt.title('T')\n```\nEnjoy.";
        let reply = AssistantReply::from_model_output(output);
        assert_eq!(reply.kind(), "plot");
        assert_eq!(reply.code(), Some("plt.plot([1, 2])\nplt.title('T')"));
        match reply {
            AssistantReply::Plot { text, .. } => assert_eq!(text.as_deref(), Some("Here you go:\n\nEnjoy.")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bare_fence_drops_language_tag() {
        assert_eq!(extract_code_block("```py\nx = 1\n```").as_deref(), Some("x = 1"));
        assert_eq!(extract_code_block("```\nx = 1\n```").as_deref(), Some("x = 1"));
        assert_eq!(extract_code_block("```x = 1```").as_deref(), Some("x = 1"));
    }

    #[test]
    fn test_no_fence_is_text() {
        let reply = AssistantReply::from_model_output("  Hello! Which file should I use?  ");
        assert_eq!(
            reply,
            AssistantReply::Text {
                text: "Hello! Which file should I use?".to_string()
            }
        );
        assert!(reply.into_submission(vec![], ExecutionOptions::default()).is_none());
    }

    #[test]
    fn test_unterminated_fence_is_not_code() {
        assert!(extract_code_block("```python").is_none());
        assert!(extract_code_block("start ```\nplt.plot([1])").is_none());
    }

    #[test]
    fn test_wire_shape_is_tagged() {
        let reply: AssistantReply =
            serde_json::from_str(r#"{"type": "clarification", "question": "Which column?"}"#).unwrap();
        assert_eq!(reply.kind(), "clarification");

        let json = serde_json::to_value(AssistantReply::Plot {
            code: "plt.plot([1])".to_string(),
            text: None,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "plot", "code": "plt.plot([1])"}));
    }

    #[test]
    fn test_only_plot_becomes_submission() {
        let reply = AssistantReply::Plot {
            code: "plt.plot(df_sales['x'])".to_string(),
            text: None,
        };
        let submission = reply
            .into_submission(
                vec![AliasBinding {
                    alias: "df_sales".to_string(),
                    path: "sales.csv".into(),
                }],
                ExecutionOptions::default(),
            )
            .unwrap();
        assert_eq!(submission.source(), "plt.plot(df_sales['x'])");
        assert_eq!(submission.bindings().len(), 1);

        let error = AssistantReply::Error {
            message: "provider unavailable".to_string(),
        };
        assert!(error.into_submission(vec![], ExecutionOptions::default()).is_none());
    }
}
