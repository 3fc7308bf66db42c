//! Annotated defaults file (`base-config` command).
//!
//! One YAML entry per field, keys sorted, enum defaults written by symbolic
//! name, each annotated with the argument's choices and help where known:
//!
//! lr_decay_style: linear  # choices: [constant, linear, cosine], Learning rate decay function.

use crate::config::model::ConfigType;
use crate::schema::value::symbolic_name;
use crate::schema::{Schema, ValueType};
use anyhow::Context;
use serde_json::Value;
use std::collections::BTreeMap;

pub fn render_base_config(ty: &ConfigType, schema: &Schema) -> anyhow::Result<String> {
    let sorted: BTreeMap<&str, Value> = ty
        .fields()
        .iter()
        .map(|f| {
            let value = match (&f.value_type, &f.default) {
                (ValueType::Enum(_), Value::String(s)) => Value::String(symbolic_name(s).to_string()),
                (_, v) => v.clone(),
            };
            (f.name.as_str(), value)
        })
        .collect();

    let mut out = String::new();
    for (name, value) in sorted {
        let entry = BTreeMap::from([(name, value)]);
        let text = serde_yaml::to_string(&entry)
            .with_context(|| format!("render default for {}", name))?;
        let comment = annotation(schema, name);
        for (i, line) in text.lines().enumerate() {
            out.push_str(line);
            if i == 0
                && let Some(comment) = &comment
            {
                out.push_str("  # ");
                out.push_str(comment);
            }
            out.push('\n');
        }
    }
    Ok(out)
}

fn annotation(schema: &Schema, name: &str) -> Option<String> {
    let choices = schema.choices_of(name).map(|choices| {
        let items: Vec<String> = choices
            .iter()
            .map(|c| match c {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        format!("choices: [{}]", items.join(", "))
    });
    // Help text may span lines in the source; keep the comment on one.
    let help = schema
        .help_of(name)
        .map(|h| h.split_whitespace().collect::<Vec<_>>().join(" "));
    match (choices, help) {
        (None, None) => None,
        (Some(c), None) => Some(c),
        (None, Some(h)) => Some(h),
        (Some(c), Some(h)) => Some(format!("{}, {}", c, h)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{Override, build};
    use crate::schema::{ArgKind, ArgumentSpec, ScalarType};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeSet;

    #[test]
    fn renders_sorted_annotated_defaults() {
        let schema: Schema = [
            ArgumentSpec::new("seed", ValueType::Scalar(ScalarType::Int), json!(1234), ArgKind::Store),
            ArgumentSpec::new(
                "lr_decay_style",
                ValueType::Scalar(ScalarType::Str),
                json!("linear"),
                ArgKind::Store,
            )
            .with_choices(vec![json!("constant"), json!("linear")])
            .with_help("Learning rate\n   decay function."),
            ArgumentSpec::new(
                "attention_backend",
                ValueType::Enum("AttnBackend".into()),
                json!("AttnBackend.auto"),
                ArgKind::Store,
            ),
            ArgumentSpec::new("rank", ValueType::Scalar(ScalarType::Int), json!(0), ArgKind::Store),
        ]
        .into_iter()
        .collect();
        let excluded = BTreeSet::from(["rank".to_string()]);
        let overrides = BTreeMap::from([("seed".to_string(), Override::Raw("7".into()))]);
        let ty = build(&schema, &excluded, &overrides).unwrap();

        let text = render_base_config(&ty, &schema).unwrap();
        assert_eq!(
            text,
            "attention_backend: auto\n\
             lr_decay_style: linear  # choices: [constant, linear], Learning rate decay function.\n\
             seed: 7\n"
        );
    }

    #[test]
    fn list_defaults_keep_comment_on_first_line() {
        let schema: Schema = [ArgumentSpec::new(
            "data_path",
            ValueType::List(ScalarType::Str),
            json!(["a", "b"]),
            ArgKind::Append,
        )
        .with_help("Data files.")]
        .into_iter()
        .collect();
        let ty = build(&schema, &BTreeSet::new(), &BTreeMap::new()).unwrap();
        let text = render_base_config(&ty, &schema).unwrap();
        assert_eq!(text, "data_path:  # Data files.\n- a\n- b\n");
    }
}
