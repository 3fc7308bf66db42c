//! Differential command-line compiler.
//!
//! Walks the schema in declaration order and emits tokens only for fields
//! whose value differs from the baseline. Emission depends on the argument
//! kind:
//! - constant flags (`StoreTrue`/`StoreFalse`/`StoreConst`): the bare flag, and
//!   only when the value equals the flag's constant
//! - `Append`: the flag followed by one token per element; empty lists emit nothing
//! - `Store`: the flag followed by one token
//!
//! Compilation never fails; values that do not match their declared type are
//! stringified as best they can be.

use crate::config::ConfigValue;
use crate::schema::value::{stringify, values_equal};
use crate::schema::{ArgKind, ArgumentSpec, ScalarType, Schema, ValueType};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Skip fields whose current value is null.
    pub skip_none: bool,
    /// Field names never compiled.
    pub ignored: BTreeSet<String>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            skip_none: true,
            ignored: BTreeSet::new(),
        }
    }
}

impl CompileOptions {
    pub fn ignoring<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored.extend(names.into_iter().map(Into::into));
        self
    }
}

/// Compile `config` into argv tokens, relative to `baseline`.
pub fn compile(
    config: &ConfigValue,
    baseline: &ConfigValue,
    schema: &Schema,
    options: &CompileOptions,
) -> Vec<String> {
    let mut tokens = Vec::new();
    for arg in schema.iter() {
        if options.ignored.contains(&arg.name) {
            continue;
        }
        let Some(value) = config.get(&arg.name) else {
            continue;
        };
        if options.skip_none && value.is_null() {
            continue;
        }
        if let Some(base) = baseline.get(&arg.name)
            && values_equal(value, base, &arg.value_type)
        {
            continue;
        }
        emit(arg, value, &mut tokens);
    }
    debug!(tokens = tokens.len(), "compiled command line");
    tokens
}

fn emit(arg: &ArgumentSpec, value: &Value, tokens: &mut Vec<String>) {
    if let Some(constant) = arg.constant() {
        // A constant flag can only say "set to the constant".
        if values_equal(value, &constant, &arg.value_type) {
            tokens.push(arg.flag.clone());
        }
        return;
    }

    match (&arg.kind, value) {
        (ArgKind::Append, Value::Array(items)) => {
            if items.is_empty() {
                return;
            }
            let elem = match &arg.value_type {
                ValueType::List(t) => ValueType::Scalar(*t),
                _ => ValueType::Scalar(ScalarType::Any),
            };
            tokens.push(arg.flag.clone());
            tokens.extend(items.iter().map(|item| stringify(item, &elem)));
        }
        // A null repeated flag has nothing to repeat.
        (ArgKind::Append, Value::Null) => {}
        _ => {
            tokens.push(arg.flag.clone());
            tokens.push(stringify(value, &arg.value_type));
        }
    }
}

/// Join a program and its compiled tokens with single spaces.
pub fn render_command(program: &str, tokens: &[String]) -> String {
    std::iter::once(program)
        .chain(tokens.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}
