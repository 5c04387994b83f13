//! Fan-out expansion: `withItems`, `withParam`, `withSequence`.
//!
//! Expansion happens after the step/task fields have been substituted, so
//! `withParam` already holds its JSON payload and sequence bounds are plain
//! integers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use foreman_model::{Item, Sequence};

use crate::error::OperateError;
use crate::scope::substitute_params;

/// Expands fan-out attributes into an ordered item list; None when the
/// step/task has no fan-out.
pub fn expand_items(
    with_items: &[Item],
    with_param: Option<&str>,
    with_sequence: Option<&Sequence>,
) -> Result<Option<Vec<Item>>, OperateError> {
    if !with_items.is_empty() {
        return Ok(Some(with_items.to_vec()));
    }
    if let Some(param) = with_param {
        let parsed: Value = serde_json::from_str(param).map_err(|err| {
            OperateError::Validation(format!("withParam value is not valid JSON: {err}"))
        })?;
        let Value::Array(values) = parsed else {
            return Err(OperateError::Validation(
                "withParam value must be a JSON list".to_string(),
            ));
        };
        return Ok(Some(values.into_iter().map(Item).collect()));
    }
    if let Some(sequence) = with_sequence {
        return Ok(Some(expand_sequence(sequence)?));
    }
    Ok(None)
}

fn sequence_bound(value: Option<&String>, what: &str) -> Result<Option<i64>, OperateError> {
    value
        .map(|raw| {
            raw.parse::<i64>().map_err(|_| {
                OperateError::Validation(format!("sequence {what} {raw:?} is not an integer"))
            })
        })
        .transpose()
}

fn expand_sequence(sequence: &Sequence) -> Result<Vec<Item>, OperateError> {
    let count = sequence_bound(sequence.count.as_ref(), "count")?;
    let start = sequence_bound(sequence.start.as_ref(), "start")?.unwrap_or(0);
    let end = sequence_bound(sequence.end.as_ref(), "end")?;

    let values: Vec<i64> = match (count, end) {
        (Some(_), Some(_)) => {
            return Err(OperateError::Validation(
                "sequence may set count or end, not both".to_string(),
            ))
        }
        (Some(count), None) => (start..start + count.max(0)).collect(),
        (None, Some(end)) if end >= start => (start..=end).collect(),
        (None, Some(end)) => (end..=start).rev().collect(),
        (None, None) => Vec::new(),
    };

    Ok(values
        .into_iter()
        .map(|i| {
            let rendered = match sequence.format.as_deref() {
                Some(format) if format.contains("%d") => format.replacen("%d", &i.to_string(), 1),
                Some(_) | None => i.to_string(),
            };
            Item(Value::String(rendered))
        })
        .collect())
}

fn item_substitution_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Binds one item into a step/task by substituting `{{item}}` and
/// `{{item.KEY}}` through its serialized form.
pub fn process_item<T>(holder: &T, item: &Item) -> Result<T, OperateError>
where
    T: Serialize + DeserializeOwned,
{
    let serialized = serde_json::to_string(holder)?;
    let substituted = substitute_params(&serialized, true, |key| {
        if key == "item" {
            return Some(item_substitution_value(&item.0));
        }
        let field = key.strip_prefix("item.")?;
        match &item.0 {
            Value::Object(fields) => fields.get(field).map(item_substitution_value),
            _ => None,
        }
    })?;
    Ok(serde_json::from_str(&substituted)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_model::WorkflowStep;
    use serde_json::json;

    #[test]
    fn with_items_take_precedence() {
        let items = vec![Item(json!("a"))];
        let expanded = expand_items(&items, Some("[1,2]"), None)
            .expect("expand")
            .expect("some");
        assert_eq!(expanded.len(), 1);
    }

    #[test]
    fn with_param_parses_a_json_list() {
        let expanded = expand_items(&[], Some("[\"x\",\"y\"]"), None)
            .expect("expand")
            .expect("some");
        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded[0].description(), "x");
        assert!(expand_items(&[], Some("{\"not\":\"a list\"}"), None).is_err());
    }

    #[test]
    fn sequence_count_start_end_and_format() {
        let by_count = expand_sequence(&Sequence {
            count: Some("3".to_string()),
            ..Default::default()
        })
        .expect("expand");
        assert_eq!(
            by_count.iter().map(Item::description).collect::<Vec<_>>(),
            ["0", "1", "2"]
        );

        let descending = expand_sequence(&Sequence {
            start: Some("5".to_string()),
            end: Some("3".to_string()),
            ..Default::default()
        })
        .expect("expand");
        assert_eq!(
            descending.iter().map(Item::description).collect::<Vec<_>>(),
            ["5", "4", "3"]
        );

        let formatted = expand_sequence(&Sequence {
            count: Some("1".to_string()),
            format: Some("host-%d".to_string()),
            ..Default::default()
        })
        .expect("expand");
        assert_eq!(formatted[0].description(), "host-0");
    }

    #[test]
    fn process_item_binds_scalars_and_map_fields() {
        let step = WorkflowStep {
            name: "print".to_string(),
            template: Some("echo".to_string()),
            arguments: foreman_model::Arguments {
                parameters: vec![foreman_model::Parameter {
                    name: "message".to_string(),
                    value: Some("{{item.word}} ({{item.count}})".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        };
        let item = Item(json!({"word": "hi", "count": 2}));
        let bound = process_item(&step, &item).expect("bind item");
        assert_eq!(
            bound.arguments.parameters[0].value.as_deref(),
            Some("hi (2)")
        );
    }
}
