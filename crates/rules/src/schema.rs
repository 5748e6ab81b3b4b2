//! YAML rule template documents with serde deserialization.
//!
//! A template file looks like:
//!
//! ```yaml
//! metadata:
//!   id: ahu-supply-temp-high
//!   version: 2
//!   name: AHU supply temperature too high
//!   enabled: true
//! applicability: "model:ahu"
//! evaluator:
//!   ref: threshold
//!   params:
//!     point: supply_temp
//!     operator: gt
//!     limit: 80.0
//! points:
//!   - alias: supply_temp
//!     capability: supply-temp-sensor
//! ```

use serde::{Deserialize, Serialize};

use faultline_core::model::{PointBinding, RuleTemplate};

/// Identity block of a template document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateMetadata {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_version() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

/// Evaluator reference plus its opaque parameter block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorRef {
    #[serde(rename = "ref")]
    pub expression_ref: String,
    #[serde(default)]
    pub params: serde_yaml::Value,
}

/// One point alias the evaluator reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointDecl {
    pub alias: String,
    pub capability: String,
}

/// A complete rule template document as authored in the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDoc {
    pub metadata: TemplateMetadata,
    pub applicability: String,
    pub evaluator: EvaluatorRef,
    #[serde(default)]
    pub points: Vec<PointDecl>,
}

impl TemplateDoc {
    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Convert into the engine's template model. YAML params become
    /// JSON values so evaluators stay serde_yaml-free.
    pub fn into_template(self) -> Result<RuleTemplate, serde_yaml::Error> {
        let params: serde_json::Value = serde_yaml::from_value(self.evaluator.params.clone())
            .unwrap_or(serde_json::Value::Null);
        Ok(RuleTemplate {
            id: self.metadata.id,
            version: self.metadata.version,
            name: self.metadata.name,
            enabled: self.metadata.enabled,
            expression_ref: self.evaluator.expression_ref,
            params,
            applicability: self.applicability,
            points: self
                .points
                .into_iter()
                .map(|p| PointBinding {
                    alias: p.alias,
                    capability: p.capability,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
metadata:
  id: ahu-supply-temp-high
  version: 2
  name: AHU supply temperature too high
applicability: "model:ahu"
evaluator:
  ref: threshold
  params:
    point: supply_temp
    operator: gt
    limit: 80.0
points:
  - alias: supply_temp
    capability: supply-temp-sensor
"#;

    #[test]
    fn test_parse_full_document() {
        let doc = TemplateDoc::from_yaml(DOC).unwrap();
        assert_eq!(doc.metadata.id, "ahu-supply-temp-high");
        assert_eq!(doc.metadata.version, 2);
        assert!(doc.metadata.enabled);
        assert_eq!(doc.evaluator.expression_ref, "threshold");
        assert_eq!(doc.points.len(), 1);

        let template = doc.into_template().unwrap();
        assert_eq!(template.applicability, "model:ahu");
        assert_eq!(template.params["limit"], serde_json::json!(80.0));
    }

    #[test]
    fn test_defaults_applied() {
        let doc = TemplateDoc::from_yaml(
            "metadata:\n  id: r1\napplicability: \"entity:e1\"\nevaluator:\n  ref: absence\n",
        )
        .unwrap();
        assert_eq!(doc.metadata.version, 1);
        assert!(doc.metadata.enabled);
        assert!(doc.points.is_empty());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let doc = TemplateDoc::from_yaml(DOC).unwrap();
        let yaml = doc.to_yaml().unwrap();
        let back = TemplateDoc::from_yaml(&yaml).unwrap();
        assert_eq!(doc, back);
    }
}
