//! Model-parameter extraction from a rendered UI description.
//!
//! The UI layer hands us the component tree it rendered for a model's
//! parameter panel. Its shape is not under our control, so the tree is first
//! classified into [`UiNode`] and then walked row by row. A row that does not
//! have the expected shape is skipped; only a malformed root fails the whole
//! extraction, and even then the data-transform keys are injected.
//!
//! Expected layout:
//!
//! ```text
//! root.props.children = [ row, row, ... ]
//! row.props.children  = [ label, container, ... ]
//! container           = Dropdown { id.param_key, value }
//!                     | { props.children = { props: leaf } }
//! ```

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_INPUT_TYPE: &str = "raw_images";

/// Widget-type marker for dropdown parameter containers.
const DROPDOWN: &str = "Dropdown";

/// A classified node of the UI description tree.
#[derive(Debug, Clone, PartialEq)]
pub enum UiNode {
    /// `props.type == "Dropdown"` with a `children` key: key and value are
    /// read directly.
    Dropdown(Widget),
    /// Anything else whose `props` carries `children`.
    Container(Children),
    /// A widget descriptor: `props` with an `id` but no `children`.
    Leaf(Widget),
    /// Labels, text, or anything not shaped like `{props: {...}}`.
    Opaque(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Children {
    One(Box<UiNode>),
    Many(Vec<UiNode>),
}

/// The fields the extractor cares about on a widget's `props`.
///
/// Each field records presence: `Some(Value::Null)` means the key exists with
/// a null value, which is different from the key being absent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Widget {
    pub key: Option<String>,
    pub value: Option<Value>,
    pub checked: Option<Value>,
    pub error: Option<Value>,
}

impl Widget {
    fn from_props(props: &Map<String, Value>) -> Self {
        let key = props
            .get("id")
            .and_then(Value::as_object)
            .and_then(|id| id.get("param_key"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            key,
            value: props.get("value").cloned(),
            checked: props.get("checked").cloned(),
            error: props.get("error").cloned(),
        }
    }

    /// Anything other than a literal `false` counts as an input error.
    fn has_error(&self) -> bool {
        matches!(&self.error, Some(e) if *e != Value::Bool(false))
    }
}

impl UiNode {
    pub fn from_value(value: &Value) -> Self {
        let Some(props) = value.get("props").and_then(Value::as_object) else {
            return UiNode::Opaque(value.clone());
        };

        // A dropdown without `children` is not a parameter container.
        if props.get("type").and_then(Value::as_str) == Some(DROPDOWN)
            && props.contains_key("children")
        {
            return UiNode::Dropdown(Widget::from_props(props));
        }

        match props.get("children") {
            Some(Value::Array(items)) => {
                UiNode::Container(Children::Many(items.iter().map(UiNode::from_value).collect()))
            }
            Some(child) => UiNode::Container(Children::One(Box::new(UiNode::from_value(child)))),
            None if props.contains_key("id") => UiNode::Leaf(Widget::from_props(props)),
            None => UiNode::Opaque(value.clone()),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            UiNode::Dropdown(_) => "dropdown",
            UiNode::Container(Children::One(_)) => "single-child container",
            UiNode::Container(Children::Many(_)) => "multi-child container",
            UiNode::Leaf(_) => "leaf",
            UiNode::Opaque(_) => "opaque node",
        }
    }
}

/// Why a node was not usable. Row-level reasons are logged and skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("expected a container with a list of children, found {0}")]
    NotAList(&'static str),
    #[error("row has {0} children, need label and input")]
    TooFewChildren(usize),
    #[error("expected a parameter container, found {0}")]
    NotAContainer(&'static str),
    #[error("expected a widget descriptor, found {0}")]
    NotAWidget(&'static str),
    #[error("widget has no string id.param_key")]
    MissingKey,
    #[error("parameter '{0}' has neither value nor checked")]
    MissingValue(String),
}

/// Data-transform settings chosen outside the parameter panel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransformOptions {
    #[serde(default)]
    pub log: bool,
    #[serde(default)]
    pub percentiles: Option<Vec<f64>>,
    /// Raw mask selection; the literal `"None"` means no mask.
    #[serde(default)]
    pub mask: Option<String>,
}

impl TransformOptions {
    fn mask_value(&self) -> Value {
        match self.mask.as_deref() {
            None | Some("None") => Value::Null,
            Some(m) => Value::String(m.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParsedParameterSet {
    pub params: HashMap<String, Value>,
    /// Set when any widget reported an input error or the root was malformed.
    /// Job submission must be blocked while this is set.
    pub errors: bool,
}

impl ParsedParameterSet {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Parameters as a JSON object with keys in sorted order.
    pub fn to_json(&self) -> Value {
        let mut keys: Vec<&String> = self.params.keys().collect();
        keys.sort();
        let mut obj = Map::new();
        for k in keys {
            obj.insert(k.clone(), self.params[k].clone());
        }
        Value::Object(obj)
    }

    fn inject(&mut self, transform: &TransformOptions) {
        self.params.insert("log".to_string(), Value::Bool(transform.log));
        let percentiles = match &transform.percentiles {
            Some(p) => serde_json::json!(p),
            None => Value::Null,
        };
        self.params.insert("percentiles".to_string(), percentiles);
        self.params.insert("mask".to_string(), transform.mask_value());
        self.params
            .entry("input_type".to_string())
            .or_insert_with(|| Value::String(DEFAULT_INPUT_TYPE.to_string()));
    }
}

/// Classify a raw JSON tree and extract its parameters.
pub fn extract_model_parameters(tree: &Value, transform: &TransformOptions) -> ParsedParameterSet {
    extract(&UiNode::from_value(tree), transform)
}

pub fn extract(root: &UiNode, transform: &TransformOptions) -> ParsedParameterSet {
    let mut set = ParsedParameterSet::default();

    match root_rows(root) {
        Ok(rows) => {
            for (idx, row) in rows.iter().enumerate() {
                match extract_row(row) {
                    Ok(param) => {
                        if param.flagged {
                            set.errors = true;
                        }
                        set.params.insert(param.key, param.value);
                    }
                    Err(reason) => debug!(row = idx, %reason, "skipping parameter row"),
                }
            }
        }
        Err(reason) => {
            warn!(%reason, "parameter tree root is malformed");
            set.errors = true;
        }
    }

    set.inject(transform);
    set
}

struct RowParam {
    key: String,
    value: Value,
    flagged: bool,
}

fn root_rows(root: &UiNode) -> Result<&[UiNode], SkipReason> {
    match root {
        UiNode::Container(Children::Many(rows)) => Ok(rows),
        other => Err(SkipReason::NotAList(other.kind())),
    }
}

fn extract_row(row: &UiNode) -> Result<RowParam, SkipReason> {
    let cells = match row {
        UiNode::Container(Children::Many(cells)) => cells,
        other => return Err(SkipReason::NotAList(other.kind())),
    };
    // cells[0] is the label, cells[1] the input container.
    let container = cells
        .get(1)
        .ok_or(SkipReason::TooFewChildren(cells.len()))?;

    match container {
        UiNode::Dropdown(widget) => {
            let key = widget.key.clone().ok_or(SkipReason::MissingKey)?;
            let value = widget
                .value
                .clone()
                .ok_or_else(|| SkipReason::MissingValue(key.clone()))?;
            Ok(RowParam {
                key,
                value,
                flagged: false,
            })
        }
        UiNode::Container(Children::One(item)) => match item.as_ref() {
            UiNode::Leaf(widget) | UiNode::Dropdown(widget) => leaf_param(widget),
            other => Err(SkipReason::NotAWidget(other.kind())),
        },
        other => Err(SkipReason::NotAContainer(other.kind())),
    }
}

fn leaf_param(widget: &Widget) -> Result<RowParam, SkipReason> {
    let key = widget.key.clone().ok_or(SkipReason::MissingKey)?;
    let value = match (&widget.value, &widget.checked) {
        (Some(v), _) => v.clone(),
        (None, Some(c)) => c.clone(),
        (None, None) => return Err(SkipReason::MissingValue(key)),
    };
    Ok(RowParam {
        key,
        value,
        flagged: widget.has_error(),
    })
}
