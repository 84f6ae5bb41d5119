//! Live / paused mode gate.
//!
//! The only stored state is the number of times the go-live control has been
//! activated. The mode is derived from its parity, so it can never drift from
//! the control that drives it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Paused,
    Live,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Paused => "paused",
            Mode::Live => "live",
        }
    }
}

/// Region styles the UI applies for a mode. Style maps use the UI's CSS
/// property names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    pub show_clusters: bool,
    pub show_feature_vectors: bool,
    pub sidebar: Value,
    pub data_overview_card: Value,
    pub image_card: Value,
    pub go_live_button: Value,
    pub pause_button: Value,
}

impl Layout {
    /// Full-width plot, sidebar and cards hidden, pause control shown.
    pub fn live() -> Self {
        Self {
            show_clusters: false,
            show_feature_vectors: false,
            sidebar: json!({ "display": "none" }),
            data_overview_card: json!({ "display": "none" }),
            image_card: json!({ "width": "98vw", "height": "88vh" }),
            go_live_button: json!({
                "display": "flex",
                "font-size": "40px",
                "padding": "5px",
                "color": "white",
                "background-color": "#00313C",
                "border": "0px",
            }),
            pause_button: json!({
                "display": "flex",
                "font-size": "1.5rem",
                "padding": "5px",
            }),
        }
    }

    pub fn browse() -> Self {
        Self {
            show_clusters: false,
            show_feature_vectors: false,
            sidebar: json!({ "overflow-y": "scroll", "height": "90vh" }),
            data_overview_card: json!({}),
            image_card: json!({ "height": "67vh" }),
            go_live_button: json!({
                "display": "flex",
                "font-size": "40px",
                "padding": "5px",
                "color": "#00313C",
                "background-color": "white",
                "border": "0px",
            }),
            pause_button: json!({ "display": "none" }),
        }
    }

    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Live => Self::live(),
            Mode::Paused => Self::browse(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeTransition {
    pub mode: Mode,
    pub activations: u64,
    pub layout: Layout,
}

impl ModeTransition {
    /// True when this transition entered live mode (and the data project must
    /// be reset).
    pub fn entered_live(&self) -> bool {
        self.mode == Mode::Live
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModeController {
    activations: u64,
}

impl ModeController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_activations(activations: u64) -> Self {
        Self { activations }
    }

    pub fn activations(&self) -> u64 {
        self.activations
    }

    pub fn mode(&self) -> Mode {
        if self.activations % 2 == 1 {
            Mode::Live
        } else {
            Mode::Paused
        }
    }

    pub fn is_live(&self) -> bool {
        self.mode() == Mode::Live
    }

    pub fn layout(&self) -> Layout {
        Layout::for_mode(self.mode())
    }

    pub fn toggle(&mut self) -> ModeTransition {
        self.activations = self.activations.wrapping_add(1);
        ModeTransition {
            mode: self.mode(),
            activations: self.activations,
            layout: self.layout(),
        }
    }
}
