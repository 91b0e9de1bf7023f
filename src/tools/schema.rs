//! 工具参数校验：按工具声明的 JSON Schema 递归检查模型给出的参数
//!
//! 只支持工具声明会用到的子集：type（string/integer/number/boolean/array/object）、enum、
//! minimum/maximum、minLength/maxLength、required/properties、items。
//! 纯函数，任何输入都不会 panic；错误全部收集后返回（仅类型不符时就地短路）。

use std::fmt;

use serde_json::Value;

/// 一条校验错误：出错的字段路径 + 人类可读的描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// 顶层标签；顶层属性的路径直接用属性名
const ROOT_LABEL: &str = "parameter";

/// 校验工具参数。schema 顶层必须是 object 类型。
pub fn validate_params(schema: &Value, params: &Value) -> Vec<ValidationError> {
    let top_type = schema.get("type").and_then(Value::as_str);
    if top_type != Some("object") {
        return vec![ValidationError {
            path: String::new(),
            message: format!(
                "Schema must be object type, got {}",
                top_type.unwrap_or("none")
            ),
        }];
    }
    let mut errors = Vec::new();
    validate_node(params, schema, ROOT_LABEL, &mut errors);
    errors
}

fn child_path(label: &str, key: &str) -> String {
    if label == ROOT_LABEL {
        key.to_string()
    } else {
        format!("{}.{}", label, key)
    }
}

fn type_matches(expected: &str, value: &Value) -> Option<bool> {
    let ok = match expected {
        "string" => value.is_string(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().map_or(false, |f| f.fract() == 0.0)
        }
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        // 未知类型不做检查
        _ => return None,
    };
    Some(ok)
}

fn push(errors: &mut Vec<ValidationError>, path: &str, message: String) {
    errors.push(ValidationError {
        path: path.to_string(),
        message,
    });
}

fn validate_node(value: &Value, schema: &Value, label: &str, errors: &mut Vec<ValidationError>) {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if type_matches(expected, value) == Some(false) {
            push(errors, label, format!("{} should be {}", label, expected));
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            push(
                errors,
                label,
                format!("{} must be one of {}", label, Value::Array(allowed.clone())),
            );
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").filter(|m| m.is_number()) {
            if min.as_f64().map_or(false, |m| n < m) {
                push(errors, label, format!("{} must be >= {}", label, min));
            }
        }
        if let Some(max) = schema.get("maximum").filter(|m| m.is_number()) {
            if max.as_f64().map_or(false, |m| n > m) {
                push(errors, label, format!("{} must be <= {}", label, max));
            }
        }
    }

    if let Some(s) = value.as_str() {
        let len = s.chars().count() as u64;
        if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
            if len < min {
                push(errors, label, format!("{} must be at least {} chars", label, min));
            }
        }
        if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
            if len > max {
                push(errors, label, format!("{} must be at most {} chars", label, max));
            }
        }
    }

    if let Some(obj) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(key) {
                    let path = child_path(label, key);
                    push(errors, &path, format!("missing required {}", path));
                }
            }
        }
        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            for (key, child) in obj {
                if let Some(child_schema) = props.get(key) {
                    validate_node(child, child_schema, &child_path(label, key), errors);
                }
            }
        }
    }

    if let Some(items) = value.as_array() {
        if let Some(item_schema) = schema.get("items").filter(|s| s.is_object()) {
            for (i, item) in items.iter().enumerate() {
                validate_node(item, item_schema, &format!("{}[{}]", label, i), errors);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn messages(errors: &[ValidationError]) -> Vec<String> {
        errors.iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn test_nested_paths_collect_all_errors() {
        let schema = json!({
            "type": "object",
            "properties": {
                "meta": {
                    "type": "object",
                    "properties": {
                        "tag": {"type": "string"},
                        "flags": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["tag"]
                }
            },
            "required": ["meta"]
        });
        let errors = validate_params(&schema, &json!({"meta": {"flags": [1, "ok"]}}));
        assert_eq!(
            messages(&errors),
            vec!["missing required meta.tag", "meta.flags[0] should be string"]
        );
        assert_eq!(errors[0].path, "meta.tag");
        assert_eq!(errors[1].path, "meta.flags[0]");
    }

    #[test]
    fn test_type_mismatch_short_circuits_node() {
        let schema = json!({
            "type": "object",
            "properties": {"count": {"type": "integer", "minimum": 1, "enum": [1, 2]}}
        });
        let errors = validate_params(&schema, &json!({"count": "3"}));
        assert_eq!(messages(&errors), vec!["count should be integer"]);
    }

    #[test]
    fn test_ranges_enum_and_lengths() {
        let schema = json!({
            "type": "object",
            "properties": {
                "mode": {"type": "string", "enum": ["fast", "full"]},
                "n": {"type": "integer", "minimum": 1, "maximum": 10},
                "q": {"type": "string", "minLength": 2, "maxLength": 4}
            },
            "required": ["q"]
        });
        let errors = validate_params(&schema, &json!({"mode": "slow", "n": 11, "q": "x"}));
        assert_eq!(
            messages(&errors),
            vec![
                r#"mode must be one of ["fast","full"]"#,
                "n must be <= 10",
                "q must be at least 2 chars",
            ]
        );

        assert!(validate_params(&schema, &json!({"n": 3.0, "q": "abc"})).is_empty());
        assert_eq!(
            messages(&validate_params(&schema, &json!({"n": 0, "q": "abcde"}))),
            vec!["n must be >= 1", "q must be at most 4 chars"]
        );
    }

    #[test]
    fn test_non_object_params_and_schema() {
        let schema = json!({"type": "object", "required": ["a"]});
        assert_eq!(
            messages(&validate_params(&schema, &json!([1]))),
            vec!["parameter should be object"]
        );
        assert_eq!(
            messages(&validate_params(&json!({"type": "array"}), &json!({}))),
            vec!["Schema must be object type, got array"]
        );
        // 非法 schema 片段不会 panic
        let odd = json!({"type": "object", "properties": {"x": 5}, "required": [1, null]});
        assert!(validate_params(&odd, &json!({"x": {"y": []}})).is_empty());
    }
}
