use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::check::Check;
use crate::columns;
use crate::config::ConfigTree;

/// Priority given to rules that do not declare one.
pub const DEFAULT_PRIORITY: i64 = 999;

/// The two record schemas that share the rule machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RecordKind {
    Po,
    Pr,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Po => "PO",
            Self::Pr => "PR",
        }
    }

    pub fn status_column(&self) -> &'static str {
        match self {
            Self::Po => columns::PO_STATUS,
            Self::Pr => columns::PR_STATUS,
        }
    }

    pub fn id_column(&self) -> &'static str {
        match self {
            Self::Po => columns::PO_ID,
            Self::Pr => columns::PR_ID,
        }
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PO" => Ok(Self::Po),
            "PR" => Ok(Self::Pr),
            other => Err(format!("unknown record kind '{other}', expected PO or PR")),
        }
    }
}

impl TryFrom<String> for RecordKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RecordKind> for String {
    fn from(kind: RecordKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combine {
    #[default]
    #[serde(alias = "AND", alias = "And")]
    And,
    #[serde(alias = "OR", alias = "Or")]
    Or,
}

/// Type conversion applied before an `equals` comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cast {
    #[serde(alias = "int64", alias = "Int64")]
    Int,
    #[serde(alias = "float64", alias = "Float64")]
    Float,
    #[serde(alias = "string")]
    Str,
}

/// A rule as it appears in a configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub status_value: Option<String>,
    #[serde(default)]
    pub status_value_key: Option<String>,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub combine: Combine,
    #[serde(default)]
    pub apply_to: Option<Vec<RecordKind>>,
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub pattern_key: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub value_key: Option<String>,
    #[serde(default)]
    pub values: Option<Vec<Value>>,
    #[serde(default)]
    pub list_key: Option<String>,
    #[serde(default)]
    pub cast: Option<Cast>,
}

impl CheckConfig {
    pub fn of_type(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }
}

/// A rule with its references resolved and its checks compiled.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub priority: i64,
    /// `None` when the configured reference did not resolve; such a rule is
    /// skipped at application time.
    pub status: Option<String>,
    pub note: String,
    pub combine: Combine,
    pub apply_to: Option<Vec<RecordKind>>,
    pub checks: Vec<Check>,
}

impl Rule {
    pub fn compile(config: &RuleConfig, tree: &ConfigTree) -> Self {
        let status = match (&config.status_value, &config.status_value_key) {
            (Some(value), _) => Some(value.clone()),
            (None, Some(key)) => tree.resolve_text(key),
            (None, None) => None,
        };
        let id = format!(
            "priority_{}_{}",
            config.priority,
            status
                .as_deref()
                .or(config.status_value_key.as_deref())
                .unwrap_or("unresolved")
        );
        if status.is_none() {
            warn!(rule = %id, "Rule has no resolvable status value");
        }

        Self {
            id,
            priority: config.priority,
            status,
            note: config.note.clone(),
            combine: config.combine,
            apply_to: config.apply_to.clone(),
            checks: config.checks.iter().map(|c| Check::compile(c, tree)).collect(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn applies_to(&self, kind: RecordKind) -> bool {
        self.apply_to
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&kind))
    }
}

/// A terminal label for rows that no declared rule claimed.
#[derive(Debug, Clone)]
pub struct FallbackLabel {
    pub status: String,
    pub note: String,
    /// `None` labels every row still unset.
    pub check: Option<Check>,
}

impl FallbackLabel {
    pub fn new(status: impl Into<String>, note: impl Into<String>, check: Option<Check>) -> Self {
        Self {
            status: status.into(),
            note: note.into(),
            check,
        }
    }

    pub(crate) fn to_rule(&self) -> Rule {
        Rule {
            id: format!("fallback_{}", self.status),
            priority: i64::MAX,
            status: Some(self.status.clone()),
            note: self.note.clone(),
            combine: Combine::And,
            apply_to: None,
            checks: vec![self.check.clone().unwrap_or(Check::Always)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_config_defaults() {
        let rule: RuleConfig = serde_json::from_value(json!({
            "status_value": "已完成",
            "checks": [{ "type": "qty_matched" }]
        }))
        .unwrap();
        assert_eq!(rule.priority, DEFAULT_PRIORITY);
        assert_eq!(rule.combine, Combine::And);
        assert!(rule.apply_to.is_none());
        assert_eq!(rule.checks[0].kind, "qty_matched");
    }

    #[test]
    fn test_record_kind_parses_case_insensitively() {
        let rule: RuleConfig = serde_json::from_value(json!({
            "combine": "OR",
            "apply_to": ["po", "PR"],
            "checks": []
        }))
        .unwrap();
        assert_eq!(rule.combine, Combine::Or);
        assert_eq!(rule.apply_to, Some(vec![RecordKind::Po, RecordKind::Pr]));
        assert!("XX".parse::<RecordKind>().is_err());
        assert_eq!(RecordKind::Pr.status_column(), "PR狀態");
    }

    #[test]
    fn test_compile_resolves_status_reference() {
        let tree = ConfigTree::from_value(json!({ "spx": { "done": "已完成" } }));
        let config: RuleConfig = serde_json::from_value(json!({
            "priority": 3,
            "status_value_key": "spx.done",
            "apply_to": ["PO"],
            "checks": [{ "type": "no_status" }]
        }))
        .unwrap();
        let rule = Rule::compile(&config, &tree);
        assert_eq!(rule.status.as_deref(), Some("已完成"));
        assert_eq!(rule.id(), "priority_3_已完成");
        assert!(rule.applies_to(RecordKind::Po));
        assert!(!rule.applies_to(RecordKind::Pr));

        let missing = RuleConfig {
            status_value_key: Some("spx.absent".into()),
            ..config
        };
        assert!(Rule::compile(&missing, &tree).status.is_none());
    }
}
