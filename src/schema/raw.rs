//! Raw argument declarations, as dumped from the external argument parser.
//!
//! JSON shape (either a bare array or `{"arguments": [...]}`):
//! [
//!   {
//!     "dest": "lr_decay_style",
//!     "option_strings": ["--lr-decay-style"],
//!     "action": "store",            // store | store_true | store_false | store_const | extend | ...
//!     "nargs": null,                // "+" / "*" make the flag list-valued
//!     "type": "str",                // int | float | str | bool | enum:<Name> | null
//!     "default": "linear",
//!     "const": null,
//!     "choices": ["constant", "linear", "cosine"],
//!     "help": "Learning rate decay function."
//!   }
//! ]
//!
//! `extract` turns these into a `Schema`. It never fails: anything it does not
//! recognize is treated as a plain stored value.

use crate::schema::spec::{ArgKind, ArgumentSpec, ScalarType, Schema, ValueType, derived_flag};
use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use tracing::debug;

/// argparse's marker for "no default, leave unset".
const SUPPRESS: &str = "==SUPPRESS==";

#[derive(Debug, Clone, Deserialize)]
pub struct RawArgument {
    pub dest: String,

    #[serde(default)]
    pub option_strings: Vec<String>,

    #[serde(default)]
    pub action: Option<String>,

    #[serde(default)]
    pub nargs: Option<Value>,

    #[serde(default, rename = "type")]
    pub type_name: Option<String>,

    #[serde(default)]
    pub default: Value,

    #[serde(default, rename = "const")]
    pub constant: Value,

    #[serde(default)]
    pub choices: Option<Vec<Value>>,

    #[serde(default)]
    pub help: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawSchema {
    List(Vec<RawArgument>),
    Wrapped { arguments: Vec<RawArgument> },
}

impl RawSchema {
    pub fn into_arguments(self) -> Vec<RawArgument> {
        match self {
            RawSchema::List(args) | RawSchema::Wrapped { arguments: args } => args,
        }
    }
}

/// Action category after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Store,
    StoreTrue,
    StoreFalse,
    StoreConst,
    Extend,
    Help,
    Unknown,
}

fn normalize_action(action: Option<&str>) -> Action {
    let Some(action) = action else {
        return Action::Store;
    };
    // Accept both `store_true` and class names like `_StoreTrueAction`.
    let key: String = action
        .trim_start_matches('_')
        .to_ascii_lowercase()
        .replace('_', "");
    let key = key.strip_suffix("action").unwrap_or(&key);
    match key {
        "store" => Action::Store,
        "storetrue" => Action::StoreTrue,
        "storefalse" => Action::StoreFalse,
        "storeconst" => Action::StoreConst,
        "extend" => Action::Extend,
        "help" | "version" => Action::Help,
        _ => Action::Unknown,
    }
}

fn scalar_type(type_name: Option<&str>) -> ValueType {
    match type_name.map(str::trim) {
        Some("int") => ValueType::Scalar(ScalarType::Int),
        Some("float") => ValueType::Scalar(ScalarType::Float),
        Some("str") => ValueType::Scalar(ScalarType::Str),
        Some("bool") => ValueType::Scalar(ScalarType::Bool),
        Some(t) if t.starts_with("enum:") => ValueType::Enum(t["enum:".len()..].to_string()),
        _ => ValueType::Scalar(ScalarType::Any),
    }
}

impl RawArgument {
    fn is_multi(&self) -> bool {
        matches!(self.nargs.as_ref().and_then(Value::as_str), Some("+") | Some("*"))
    }

    fn is_suppressed(&self) -> bool {
        self.default.as_str() == Some(SUPPRESS)
    }

    /// Spelling of a constant flag: the first declared long option, falling
    /// back to the first option, then to the spelling derived from `dest`.
    fn declared_flag(&self) -> String {
        self.option_strings
            .iter()
            .find(|s| s.starts_with("--"))
            .or_else(|| self.option_strings.first())
            .cloned()
            .unwrap_or_else(|| derived_flag(&self.dest))
    }

    /// Normalize into an `ArgumentSpec`. `None` for help/version entries and
    /// suppressed defaults, which are not configuration.
    pub fn to_spec(&self) -> Option<ArgumentSpec> {
        let action = normalize_action(self.action.as_deref());
        if action == Action::Help || self.is_suppressed() {
            return None;
        }

        // Multi-value flags are lists whatever action consumes them; only the
        // constant flags keep their own kind.
        let (kind, value_type) = match action {
            Action::StoreTrue => (ArgKind::StoreTrue, ValueType::Scalar(ScalarType::Bool)),
            Action::StoreFalse => (ArgKind::StoreFalse, ValueType::Scalar(ScalarType::Bool)),
            Action::StoreConst => (
                ArgKind::StoreConst(self.constant.clone()),
                scalar_type(self.type_name.as_deref()),
            ),
            _ if self.is_multi() || action == Action::Extend => {
                let base = match scalar_type(self.type_name.as_deref()) {
                    ValueType::Scalar(ScalarType::Any) => ScalarType::Str,
                    ValueType::Scalar(t) => t,
                    ValueType::List(t) => t,
                    ValueType::Enum(_) => ScalarType::Str,
                };
                (ArgKind::Append, ValueType::List(base))
            }
            Action::Store => (ArgKind::Store, scalar_type(self.type_name.as_deref())),
            Action::Extend | Action::Help | Action::Unknown => {
                (ArgKind::Store, ValueType::Scalar(ScalarType::Any))
            }
        };

        // Valued flags are always spelled from `dest`; constant flags keep the
        // option the parser declared (e.g. `--no-bias-gelu-fusion`).
        let flag = match kind {
            ArgKind::StoreTrue | ArgKind::StoreFalse | ArgKind::StoreConst(_) => {
                self.declared_flag()
            }
            ArgKind::Store | ArgKind::Append => derived_flag(&self.dest),
        };

        Some(ArgumentSpec {
            name: self.dest.clone(),
            flag,
            value_type,
            default: self.default.clone(),
            kind,
            choices: self.choices.clone().filter(|c| !c.is_empty()),
            help: self.help.clone().filter(|h| !h.trim().is_empty()),
        })
    }
}

/// Normalize external declarations into a `Schema`, keeping declaration order.
pub fn extract(raw: &[RawArgument]) -> Schema {
    let mut schema = Schema::new();
    for arg in raw {
        let Some(spec) = arg.to_spec() else {
            debug!(dest = %arg.dest, "skipping non-config argument");
            continue;
        };
        if !schema.insert(spec) {
            debug!(dest = %arg.dest, "duplicate destination, first declaration governs");
        }
    }
    schema
}

/// Read and extract an argument dump from a JSON file.
pub fn load_schema(path: &str) -> anyhow::Result<Schema> {
    let text = fs::read_to_string(path).with_context(|| format!("read schema file {}", path))?;
    let raw: RawSchema =
        serde_json::from_str(&text).with_context(|| format!("parse schema file {}", path))?;
    let schema = extract(&raw.into_arguments());
    debug!(path, arguments = schema.len(), "loaded argument schema");
    Ok(schema)
}
