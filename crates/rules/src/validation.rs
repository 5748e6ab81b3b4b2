//! Template validation with structured errors and warnings.
//!
//! Errors block application (the reconciler reports them as conflicts);
//! warnings are advisory and logged only.

use serde::Serialize;

use faultline_core::model::RuleTemplate;

use crate::evaluator::EvaluatorProvider;

/// A single validation finding.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Dotted path to the offending field (e.g. "evaluator.ref").
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            field: field.to_string(),
            message: message.into(),
        });
    }

    fn warning(&mut self, field: &str, message: impl Into<String>) {
        self.warnings.push(ValidationIssue {
            field: field.to_string(),
            message: message.into(),
        });
    }

    /// Compact one-line summary of the errors, for conflict reports.
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validate a template against the evaluator provider.
///
/// Checks: non-empty id and applicability query, known applicability
/// scheme, resolvable evaluator reference, point aliases unique, and
/// evaluator-specific parameter shape.
pub fn validate_template(
    template: &RuleTemplate,
    provider: &EvaluatorProvider,
) -> ValidationResult {
    let mut result = ValidationResult::default();

    if template.id.trim().is_empty() {
        result.error("metadata.id", "must not be empty");
    }
    if template.version == 0 {
        result.error("metadata.version", "must be >= 1");
    }
    if template.name.trim().is_empty() {
        result.warning("metadata.name", "empty name makes insights hard to read");
    }

    let query = template.applicability.trim();
    if query.is_empty() {
        result.error("applicability", "must not be empty");
    } else if !query.starts_with("model:") && !query.starts_with("entity:") {
        result.error(
            "applicability",
            format!("unknown query scheme '{}', expected model:<id> or entity:<id>", query),
        );
    } else if query.splitn(2, ':').nth(1).map(str::trim).unwrap_or("").is_empty() {
        result.error("applicability", "query selector must not be empty");
    }

    match provider.resolve(&template.expression_ref) {
        Some(evaluator) => {
            if let Err(msg) = evaluator.check_params(&template.params) {
                result.error("evaluator.params", msg);
            }
        }
        None => {
            result.error(
                "evaluator.ref",
                format!("no evaluator registered for '{}'", template.expression_ref),
            );
        }
    }

    let mut seen = std::collections::HashSet::new();
    for point in &template.points {
        if point.alias.trim().is_empty() {
            result.error("points.alias", "must not be empty");
        }
        if !seen.insert(point.alias.as_str()) {
            result.error("points.alias", format!("duplicate alias '{}'", point.alias));
        }
    }

    result
}
