//! Configuration tree and reference resolution.
//!
//! Rule sections and the shared vocabulary they point at (keyword patterns,
//! supplier lists, account lists) live in one nested document. Rules refer to
//! that vocabulary with dotted paths such as `spx.deposit_keywords`.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, File, FileFormat};
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::check;
use crate::rule::RuleConfig;

/// Keys whose value is assembled from other keys rather than read directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeKey {
    /// `spx.asset_suppliers`: kiosk suppliers followed by locker suppliers.
    AssetSuppliers,
}

impl CompositeKey {
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "spx.asset_suppliers" => Some(Self::AssetSuppliers),
            _ => None,
        }
    }

    fn parts(&self) -> &'static [&'static str] {
        match self {
            Self::AssetSuppliers => &["spx.kiosk_suppliers", "spx.locker_suppliers"],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigTree {
    root: Value,
}

impl ConfigTree {
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = Config::builder()
            .add_source(File::from(path))
            .build()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        let root: Value = settings
            .try_deserialize()
            .context("Configuration is not a valid document")?;
        Ok(Self { root })
    }

    pub fn from_str_with_format(source: &str, format: FileFormat) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(source, format))
            .build()
            .context("Failed to parse configuration")?;
        let root: Value = settings
            .try_deserialize()
            .context("Configuration is not a valid document")?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Resolves a dotted path. Each segment is matched exactly first and
    /// case-insensitively second. Missing segments log a warning and yield
    /// `None`.
    pub fn resolve(&self, path: &str) -> Option<Value> {
        if let Some(composite) = CompositeKey::from_path(path) {
            return self.resolve_composite(path, composite);
        }
        self.walk(path).cloned()
    }

    fn resolve_composite(&self, path: &str, key: CompositeKey) -> Option<Value> {
        let mut merged = Vec::new();
        for part in key.parts() {
            match self.walk(part) {
                Some(Value::Array(items)) => merged.extend(items.iter().cloned()),
                Some(other) => merged.push(other.clone()),
                None => {
                    warn!(path, missing = part, "Composite reference is incomplete");
                    return None;
                }
            }
        }
        Some(Value::Array(merged))
    }

    fn walk(&self, path: &str) -> Option<&Value> {
        let mut current = &self.root;
        for segment in path.split('.') {
            let Value::Object(map) = current else {
                warn!(path, segment, "Reference walks through a non-table value");
                return None;
            };
            let next = map.get(segment).filter(|v| !v.is_null()).or_else(|| {
                map.iter()
                    .find(|(k, v)| k.eq_ignore_ascii_case(segment) && !v.is_null())
                    .map(|(_, v)| v)
            });
            match next {
                Some(value) => current = value,
                None => {
                    warn!(path, segment, "Unresolved configuration reference");
                    return None;
                }
            }
        }
        Some(current)
    }

    /// Resolves a path to its text form. Scalars are rendered, tables and
    /// lists are rejected.
    pub fn resolve_text(&self, path: &str) -> Option<String> {
        self.resolve(path).and_then(|v| value_to_text(&v))
    }

    /// Resolves a path to a list of strings. A scalar becomes a one-element
    /// list.
    pub fn resolve_list(&self, path: &str) -> Option<Vec<String>> {
        match self.resolve(path)? {
            Value::Array(items) => Some(items.iter().filter_map(value_to_text).collect()),
            other => value_to_text(&other).map(|s| vec![s]),
        }
    }

    /// Deserializes `<section>.conditions`. A rule that does not deserialize
    /// is logged and dropped; a missing section yields no rules.
    pub fn rule_section(&self, section: &str) -> Vec<RuleConfig> {
        let Some(conditions) = self.section_conditions(section) else {
            warn!(section, "Rule section has no conditions");
            return Vec::new();
        };

        conditions
            .iter()
            .enumerate()
            .filter_map(|(index, raw)| match serde_json::from_value(raw.clone()) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!(section, index, error = %e, "Skipping malformed rule");
                    None
                }
            })
            .collect()
    }

    fn section_conditions(&self, section: &str) -> Option<&Vec<Value>> {
        match self.walk(section)? {
            Value::Object(map) => map.get("conditions")?.as_array(),
            _ => None,
        }
    }

    /// Reports every problem found in a rule section without failing.
    pub fn validate_rule_section(&self, section: &str) -> Vec<ConfigIssue> {
        let Some(conditions) = self.section_conditions(section) else {
            return vec![ConfigIssue::section(section, "section or its conditions list is missing")];
        };

        let mut issues = Vec::new();
        for (index, raw) in conditions.iter().enumerate() {
            let rule: RuleConfig = match serde_json::from_value(raw.clone()) {
                Ok(rule) => rule,
                Err(e) => {
                    issues.push(ConfigIssue::rule(section, index, format!("malformed rule: {e}")));
                    continue;
                }
            };
            self.validate_rule(section, index, &rule, &mut issues);
        }
        issues
    }

    fn validate_rule(
        &self,
        section: &str,
        index: usize,
        rule: &RuleConfig,
        issues: &mut Vec<ConfigIssue>,
    ) {
        let mut push = |message: String| issues.push(ConfigIssue::rule(section, index, message));

        match (&rule.status_value, &rule.status_value_key) {
            (Some(_), _) => {}
            (None, Some(key)) => {
                if self.resolve_text(key).is_none() {
                    push(format!("status_value_key '{key}' does not resolve"));
                }
            }
            (None, None) => push("rule has neither status_value nor status_value_key".into()),
        }

        if rule.checks.is_empty() {
            push("rule has no checks".into());
        }

        for check in &rule.checks {
            if !check::is_known_type(&check.kind) {
                push(format!(
                    "check type '{}' is not built in and only matches through a prebuilt mask",
                    check.kind
                ));
            }
            if check::needs_field(&check.kind) && check.field.is_none() {
                push(format!("check '{}' needs a field", check.kind));
            }
            if let Some(pattern) = &check.pattern {
                if let Err(e) = Regex::new(pattern) {
                    push(format!("invalid pattern '{pattern}': {e}"));
                }
            }
            for key in [&check.pattern_key, &check.value_key, &check.list_key]
                .into_iter()
                .flatten()
            {
                if self.resolve(key).is_none() {
                    push(format!("reference '{key}' does not resolve"));
                }
            }
        }
    }
}

/// Renders a scalar configuration value the way it would appear in a cell.
pub fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub section: String,
    pub rule_index: Option<usize>,
    pub message: String,
}

impl ConfigIssue {
    fn section(section: &str, message: &str) -> Self {
        Self {
            section: section.to_string(),
            rule_index: None,
            message: message.to_string(),
        }
    }

    fn rule(section: &str, index: usize, message: String) -> Self {
        Self {
            section: section.to_string(),
            rule_index: Some(index),
            message,
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rule_index {
            Some(index) => write!(f, "{}[{}]: {}", self.section, index, self.message),
            None => write!(f, "{}: {}", self.section, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn tree() -> ConfigTree {
        ConfigTree::from_value(json!({
            "spx": {
                "deposit_keywords": "訂金|押金",
                "kiosk_suppliers": ["K1", "K2"],
                "locker_suppliers": ["L1"],
                "Status_Label": "已完成"
            },
            "fa_accounts": { "spx": ["151101", "151201"] }
        }))
    }

    #[test]
    fn test_resolve_walks_dotted_paths() {
        let t = tree();
        assert_eq!(t.resolve_text("spx.deposit_keywords").as_deref(), Some("訂金|押金"));
        assert_eq!(
            t.resolve_list("fa_accounts.spx"),
            Some(vec!["151101".to_string(), "151201".to_string()])
        );
        assert!(t.resolve("spx.missing").is_none());
        assert!(t.resolve("spx.deposit_keywords.deeper").is_none());
    }

    #[test]
    fn test_resolve_falls_back_to_case_insensitive_segments() {
        let t = tree();
        assert_eq!(t.resolve_text("SPX.status_label").as_deref(), Some("已完成"));
    }

    #[test]
    fn test_asset_suppliers_concatenates_kiosk_and_locker() {
        assert_eq!(
            tree().resolve_list("spx.asset_suppliers"),
            Some(vec!["K1".to_string(), "K2".to_string(), "L1".to_string()])
        );
        let partial = ConfigTree::from_value(json!({ "spx": { "kiosk_suppliers": ["K1"] } }));
        assert!(partial.resolve("spx.asset_suppliers").is_none());
    }

    #[test]
    fn test_rule_section_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[spx]
done = "已完成"

[[erm_status_rules.conditions]]
priority = 2
status_value_key = "spx.done"
note = "completed"
checks = [{{ type = "qty_matched" }}]

[[erm_status_rules.conditions]]
priority = "not a number"
status_value = "x"
checks = []
"#
        )
        .unwrap();

        let t = ConfigTree::from_file(file.path()).unwrap();
        let rules = t.rule_section("erm_status_rules");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].priority, 2);
        assert_eq!(rules[0].status_value_key.as_deref(), Some("spx.done"));

        let issues = t.validate_rule_section("erm_status_rules");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].rule_index, Some(1));
    }

    #[test]
    fn test_validate_reports_unresolved_references_and_bad_patterns() {
        let t = ConfigTree::from_value(json!({
            "stage": { "conditions": [
                {
                    "status_value_key": "spx.nope",
                    "checks": [
                        { "type": "contains", "field": "Item Description", "pattern": "(" },
                        { "type": "in_list", "field": "Supplier", "list_key": "spx.asset_suppliers" },
                        { "type": "in_closed_list" }
                    ]
                }
            ]}
        }));
        let issues = t.validate_rule_section("stage");
        let messages: Vec<_> = issues.iter().map(|i| i.message.as_str()).collect();
        assert_eq!(issues.len(), 4, "{messages:?}");
        assert!(messages.iter().any(|m| m.contains("spx.nope")));
        assert!(messages.iter().any(|m| m.contains("invalid pattern")));
        assert!(messages.iter().any(|m| m.contains("in_closed_list")));
        assert!(t.validate_rule_section("absent")[0].rule_index.is_none());
    }
}
