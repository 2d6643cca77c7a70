use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::app_state::AppError;

/// AND/OR tree of leaf predicates over an allow-listed field set. Presets
/// are stored as JSON and compiled to a SQL fragment server-side; unknown
/// fields or operators fail at the API boundary and never reach the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionNode {
    And(Vec<ConditionNode>),
    Or(Vec<ConditionNode>),
    #[serde(untagged)]
    Leaf {
        field: String,
        op: ConditionOp,
        value: serde_json::Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Contains,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresetScope {
    Wanted,
    Library,
    History,
}

fn allowed_fields(scope: PresetScope) -> HashMap<&'static str, &'static str> {
    let mut fields = HashMap::new();
    match scope {
        PresetScope::Wanted => {
            fields.insert("title", "title");
            fields.insert("status", "status");
            fields.insert("subtitle_type", "subtitle_type");
            fields.insert("target_language", "target_language");
            fields.insert("item_kind", "item_kind");
            fields.insert("instance_name", "instance_name");
            fields.insert("attempts", "attempts");
            fields.insert("upgrade_candidate", "upgrade_candidate");
            fields.insert("created_at", "created_at");
            fields.insert("updated_at", "updated_at");
        }
        PresetScope::Library => {
            fields.insert("title", "title");
            fields.insert("year", "year");
            fields.insert("is_anime", "is_anime");
        }
        PresetScope::History => {
            fields.insert("provider", "provider");
            fields.insert("language", "language");
            fields.insert("subtitle_type", "subtitle_type");
            fields.insert("score", "score");
            fields.insert("downloaded_at", "downloaded_at");
        }
    }
    fields
}

/// Compile a condition tree into a SQL WHERE fragment. Values are rendered
/// as escaped literals; field names come exclusively from the allow-list.
pub fn compile(scope: PresetScope, tree: &ConditionNode) -> Result<String, AppError> {
    let fields = allowed_fields(scope);
    compile_node(tree, &fields)
}

pub fn parse_and_compile(scope: PresetScope, condition_json: &str) -> Result<String, AppError> {
    let tree: ConditionNode = serde_json::from_str(condition_json)
        .map_err(|e| AppError::bad_request(format!("invalid condition tree: {e}")))?;
    compile(scope, &tree)
}

fn compile_node(
    node: &ConditionNode,
    fields: &HashMap<&'static str, &'static str>,
) -> Result<String, AppError> {
    match node {
        ConditionNode::And(children) => combine(children, fields, " AND "),
        ConditionNode::Or(children) => combine(children, fields, " OR "),
        ConditionNode::Leaf { field, op, value } => {
            let column = fields
                .get(field.as_str())
                .ok_or_else(|| AppError::bad_request(format!("unknown filter field: {field}")))?;
            let rendered = render_value(value, *op)?;
            let operator = match op {
                ConditionOp::Eq => "=",
                ConditionOp::Ne => "!=",
                ConditionOp::Lt => "<",
                ConditionOp::Lte => "<=",
                ConditionOp::Gt => ">",
                ConditionOp::Gte => ">=",
                ConditionOp::Contains => "LIKE",
            };
            Ok(format!("{column} {operator} {rendered}"))
        }
    }
}

fn combine(
    children: &[ConditionNode],
    fields: &HashMap<&'static str, &'static str>,
    joiner: &str,
) -> Result<String, AppError> {
    if children.is_empty() {
        return Err(AppError::bad_request("empty condition group"));
    }
    let parts: Result<Vec<String>, AppError> = children
        .iter()
        .map(|child| compile_node(child, fields))
        .collect();
    Ok(format!("({})", parts?.join(joiner)))
}

fn render_value(value: &serde_json::Value, op: ConditionOp) -> Result<String, AppError> {
    match value {
        serde_json::Value::String(s) => {
            let escaped = s.replace('\'', "''");
            if op == ConditionOp::Contains {
                let escaped = escaped.replace('%', "\\%").replace('_', "\\_");
                Ok(format!("'%{escaped}%' ESCAPE '\\'"))
            } else {
                Ok(format!("'{escaped}'"))
            }
        }
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(if *b { "1" } else { "0" }.to_string()),
        rest => Err(AppError::bad_request(format!(
            "unsupported filter value: {rest}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_nested_tree() {
        let json = r#"{
            "and": [
                {"field": "status", "op": "eq", "value": "wanted"},
                {"or": [
                    {"field": "attempts", "op": "gte", "value": 3},
                    {"field": "title", "op": "contains", "value": "Frieren"}
                ]}
            ]
        }"#;
        let sql = parse_and_compile(PresetScope::Wanted, json).unwrap();
        assert_eq!(
            sql,
            "(status = 'wanted' AND (attempts >= 3 OR title LIKE '%Frieren%' ESCAPE '\\'))"
        );
    }

    #[test]
    fn unknown_field_is_rejected() {
        let json = r#"{"field": "password", "op": "eq", "value": "x"}"#;
        let err = parse_and_compile(PresetScope::Wanted, json).unwrap_err();
        assert!(err.message.contains("unknown filter field"));
    }

    #[test]
    fn quotes_are_escaped() {
        let json = r#"{"field": "title", "op": "eq", "value": "it's"}"#;
        let sql = parse_and_compile(PresetScope::Wanted, json).unwrap();
        assert_eq!(sql, "title = 'it''s'");
    }

    #[test]
    fn empty_groups_are_invalid() {
        let json = r#"{"and": []}"#;
        assert!(parse_and_compile(PresetScope::Wanted, json).is_err());
    }

    #[test]
    fn scope_restricts_fields() {
        let json = r#"{"field": "status", "op": "eq", "value": "wanted"}"#;
        assert!(parse_and_compile(PresetScope::History, json).is_err());
        let json = r#"{"field": "score", "op": "gt", "value": 50}"#;
        assert!(parse_and_compile(PresetScope::History, json).is_ok());
    }
}
