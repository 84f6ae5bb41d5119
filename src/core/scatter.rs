//! Incremental scatter-plot merging for live latent vectors.
//!
//! The plot is either [`ScatterState::Uninitialized`], in which case the next
//! result regenerates it from scratch, or [`ScatterState::Initialized`], in
//! which case new rows are appended to the primary trace. Within a trace `x`,
//! `y`, `customdata` (and `z` for 3-D plots) always have equal length and
//! `customdata[i] == [i]`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::error::LiveError;
use crate::results::{DimRedResult, LatentMatrix, ResultKey};

/// How appended live coordinates are coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateCoercion {
    #[default]
    Float,
    /// Truncate toward zero.
    Integer,
}

impl CoordinateCoercion {
    fn apply(self, v: f64) -> f64 {
        match self {
            CoordinateCoercion::Float => v,
            CoordinateCoercion::Integer => v.trunc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScatterTrace {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<Vec<f64>>,
    pub customdata: Vec<[u64; 1]>,
}

impl ScatterTrace {
    fn empty(dims: u32) -> Self {
        Self {
            z: (dims == 3).then(Vec::new),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.customdata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.customdata.is_empty()
    }

    pub fn dims(&self) -> usize {
        if self.z.is_some() {
            3
        } else {
            2
        }
    }

    /// Append one point; `row` must hold at least `dims()` values.
    fn push_row(&mut self, row: &[f64], coercion: CoordinateCoercion) {
        let idx = self.len() as u64;
        self.x.push(coercion.apply(row[0]));
        self.y.push(coercion.apply(row[1]));
        if let Some(z) = self.z.as_mut() {
            z.push(coercion.apply(row[2]));
        }
        self.customdata.push([idx]);
    }

    /// Read a plotly trace. `None` only when `customdata` is absent or not a
    /// list, which marks a plot that was never populated.
    ///
    /// Figures drawn elsewhere may carry stale `customdata` (repeated or
    /// missing indices) or coordinate lists of unequal length. Such traces are
    /// cut to their shortest coordinate list and renumbered `[0], [1], ...`,
    /// so every rendered point survives the next append.
    fn from_json(trace: &Value) -> Option<Self> {
        let customdata = trace.get("customdata")?.as_array()?;
        let mut x = number_list(trace.get("x"));
        let mut y = number_list(trace.get("y"));
        let mut z = match trace.get("z") {
            Some(z) if !z.is_null() => Some(number_list(Some(z))),
            _ => None,
        };

        let n = x
            .len()
            .min(y.len())
            .min(z.as_ref().map_or(usize::MAX, Vec::len));
        let canonical = customdata.len() == n
            && customdata.iter().enumerate().all(|(i, c)| index_of(c) == Some(i as u64));
        if !canonical || x.len() != n || y.len() != n {
            debug!(
                points = n,
                customdata = customdata.len(),
                "renumbering non-canonical trace"
            );
        }
        x.truncate(n);
        y.truncate(n);
        if let Some(z) = z.as_mut() {
            z.truncate(n);
        }
        Some(Self {
            x,
            y,
            z,
            customdata: (0..n as u64).map(|i| [i]).collect(),
        })
    }

    fn to_json(&self) -> Value {
        let mut v = json!({
            "type": if self.z.is_some() { "scatter3d" } else { "scatter" },
            "mode": "markers",
            "x": self.x,
            "y": self.y,
            "customdata": self.customdata,
        });
        if let Some(z) = &self.z {
            v["z"] = json!(z);
        }
        v
    }
}

/// Coordinates as plotted. A missing or non-list value is an empty list;
/// entries plotly cannot place become NaN so positions are kept.
fn number_list(v: Option<&Value>) -> Vec<f64> {
    let Some(items) = v.and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .map(|n| match n {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .map(|n| n.unwrap_or(f64::NAN))
        .collect()
}

fn index_of(c: &Value) -> Option<u64> {
    match c {
        Value::Array(inner) => inner.first().and_then(Value::as_u64),
        other => other.as_u64(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScatterFigure {
    /// The first trace is the one live points are appended to.
    pub traces: Vec<ScatterTrace>,
}

impl ScatterFigure {
    pub fn primary(&self) -> Option<&ScatterTrace> {
        self.traces.first()
    }

    pub fn point_count(&self) -> usize {
        self.primary().map_or(0, ScatterTrace::len)
    }

    pub fn to_figure_json(&self) -> Value {
        json!({
            "data": self.traces.iter().map(ScatterTrace::to_json).collect::<Vec<_>>(),
            "layout": {},
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "figure", rename_all = "snake_case")]
pub enum ScatterState {
    #[default]
    Uninitialized,
    Initialized(ScatterFigure),
}

impl ScatterState {
    /// Interpret a figure as sent by the UI. A missing `data` list, or a
    /// primary trace whose `customdata` is absent or not a list, means the
    /// plot was never populated. Any other trace is kept and renumbered.
    pub fn from_figure_json(figure: &Value) -> Self {
        let Some(data) = figure.get("data").and_then(Value::as_array) else {
            return ScatterState::Uninitialized;
        };
        let Some(primary) = data.first().and_then(ScatterTrace::from_json) else {
            return ScatterState::Uninitialized;
        };
        let mut traces = vec![primary];
        for (i, extra) in data.iter().enumerate().skip(1) {
            match ScatterTrace::from_json(extra) {
                Some(t) => traces.push(t),
                None => debug!(trace = i, "dropping unparsable secondary trace"),
            }
        }
        ScatterState::Initialized(ScatterFigure { traces })
    }

    pub fn to_figure_json(&self) -> Value {
        match self {
            ScatterState::Uninitialized => json!({ "data": [], "layout": {} }),
            ScatterState::Initialized(fig) => fig.to_figure_json(),
        }
    }

    pub fn point_count(&self) -> usize {
        match self {
            ScatterState::Uninitialized => 0,
            ScatterState::Initialized(fig) => fig.point_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FigureError {
    #[error("scatter plots support 2 or 3 components, got {0}")]
    UnsupportedComponents(u32),
    #[error("need {needed} columns, latent matrix has {found}")]
    TooFewColumns { needed: usize, found: usize },
}

/// Lay out a fresh single-trace figure over all rows of `points`.
pub fn generate_scatter_figure(
    points: &LatentMatrix,
    n_components: u32,
) -> Result<ScatterFigure, FigureError> {
    if !(2..=3).contains(&n_components) {
        return Err(FigureError::UnsupportedComponents(n_components));
    }
    let needed = n_components as usize;
    if points.rows() > 0 && points.cols() < needed {
        return Err(FigureError::TooFewColumns {
            needed,
            found: points.cols(),
        });
    }
    let mut trace = ScatterTrace::empty(n_components);
    for row in points.iter_rows() {
        trace.push_row(row, CoordinateCoercion::Float);
    }
    Ok(ScatterFigure {
        traces: vec![trace],
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// The plot was regenerated from the full result.
    Initialized { points: usize },
    /// Rows were appended to the primary trace.
    Appended { added: usize, total: usize },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScatterMerger {
    pub coercion: CoordinateCoercion,
}

impl ScatterMerger {
    pub fn new(coercion: CoordinateCoercion) -> Self {
        Self { coercion }
    }

    /// Merge `result` into `state`. On error `state` is unchanged.
    ///
    /// Every row of the result is appended in order; each gets the next
    /// point index as its `customdata`.
    pub fn merge(
        &self,
        state: &mut ScatterState,
        key: &ResultKey,
        result: &DimRedResult,
    ) -> Result<MergeOutcome, LiveError> {
        let primary = match state {
            ScatterState::Initialized(fig) => fig.traces.first_mut(),
            ScatterState::Uninitialized => None,
        };

        let Some(trace) = primary else {
            let n = result
                .metadata
                .model_parameters
                .n_components
                .ok_or_else(|| LiveError::schema(key, "model_parameters.n_components is missing"))?;
            let fig = generate_scatter_figure(&result.content, n)
                .map_err(|e| LiveError::schema(key, e.to_string()))?;
            let points = fig.point_count();
            *state = ScatterState::Initialized(fig);
            return Ok(MergeOutcome::Initialized { points });
        };

        let content = &result.content;
        if content.rows() > 0 && content.cols() < trace.dims() {
            return Err(LiveError::schema(
                key,
                FigureError::TooFewColumns {
                    needed: trace.dims(),
                    found: content.cols(),
                }
                .to_string(),
            ));
        }
        for row in content.iter_rows() {
            trace.push_row(row, self.coercion);
        }
        Ok(MergeOutcome::Appended {
            added: content.rows(),
            total: trace.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::{ModelParameters, ResultMetadata};

    fn result(rows: Vec<Vec<f64>>, n: Option<u32>) -> DimRedResult {
        DimRedResult {
            metadata: ResultMetadata {
                model_parameters: ModelParameters { n_components: n },
                ..ResultMetadata::default()
            },
            content: LatentMatrix::from_rows(rows).unwrap(),
        }
    }

    fn key() -> ResultKey {
        ResultKey::new("u", "p", "f")
    }

    #[test]
    fn first_result_replaces_uninitialized_plot() {
        let mut state = ScatterState::Uninitialized;
        let out = ScatterMerger::default()
            .merge(&mut state, &key(), &result(vec![vec![1.5, 2.5], vec![3.0, 4.0]], Some(2)))
            .unwrap();
        assert_eq!(out, MergeOutcome::Initialized { points: 2 });

        let ScatterState::Initialized(fig) = &state else {
            panic!("expected initialized plot");
        };
        let t = fig.primary().unwrap();
        assert_eq!(t.x, vec![1.5, 3.0]);
        assert_eq!(t.y, vec![2.5, 4.0]);
        assert_eq!(t.customdata, vec![[0], [1]]);
        assert!(t.z.is_none());
    }

    #[test]
    fn second_result_appends_one_point_preserving_prior() {
        let mut state = ScatterState::Uninitialized;
        let merger = ScatterMerger::default();
        merger
            .merge(&mut state, &key(), &result(vec![vec![0.0, 1.0]], Some(2)))
            .unwrap();
        let before = state.clone();

        let out = merger
            .merge(&mut state, &key(), &result(vec![vec![7.25, -2.0]], None))
            .unwrap();
        assert_eq!(out, MergeOutcome::Appended { added: 1, total: 2 });

        let (ScatterState::Initialized(old), ScatterState::Initialized(new)) = (&before, &state)
        else {
            panic!("expected initialized plots");
        };
        let (o, n) = (old.primary().unwrap(), new.primary().unwrap());
        assert_eq!(&n.x[..1], &o.x[..]);
        assert_eq!(&n.y[..1], &o.y[..]);
        assert_eq!(&n.customdata[..1], &o.customdata[..]);
        assert_eq!(n.x[1], 7.25);
        assert_eq!(n.y[1], -2.0);
        assert_eq!(n.customdata[1], [1]);
    }

    #[test]
    fn figure_without_customdata_is_uninitialized() {
        let fig = json!({ "data": [ { "x": [1], "y": [2], "type": "scatter" } ] });
        assert_eq!(ScatterState::from_figure_json(&fig), ScatterState::Uninitialized);
        assert_eq!(ScatterState::from_figure_json(&json!({})), ScatterState::Uninitialized);
        assert_eq!(
            ScatterState::from_figure_json(&json!({ "data": [] })),
            ScatterState::Uninitialized
        );
    }

    #[test]
    fn figure_with_customdata_appends() {
        let fig = json!({
            "data": [ { "x": [1, 2], "y": ["3", 4], "customdata": [[0], [1]] } ]
        });
        let mut state = ScatterState::from_figure_json(&fig);
        assert_eq!(state.point_count(), 2);

        ScatterMerger::default()
            .merge(&mut state, &key(), &result(vec![vec![5.0, 6.0]], Some(2)))
            .unwrap();
        let out = state.to_figure_json();
        assert_eq!(out["data"][0]["x"], json!([1.0, 2.0, 5.0]));
        assert_eq!(out["data"][0]["y"], json!([3.0, 4.0, 6.0]));
        assert_eq!(out["data"][0]["customdata"], json!([[0], [1], [2]]));
    }

    #[test]
    fn repeated_customdata_keeps_rendered_points() {
        let fig = json!({ "data": [ { "x": [1, 2, 3], "y": [4, 5, 6], "customdata": [[0], [0], [0]] } ] });
        let mut state = ScatterState::from_figure_json(&fig);
        assert_eq!(state.point_count(), 3);

        let out = ScatterMerger::default()
            .merge(&mut state, &key(), &result(vec![vec![7.0, 8.0]], Some(2)))
            .unwrap();
        assert_eq!(out, MergeOutcome::Appended { added: 1, total: 4 });
        let ScatterState::Initialized(fig) = &state else {
            panic!("expected initialized plot");
        };
        let t = fig.primary().unwrap();
        assert_eq!(t.x, vec![1.0, 2.0, 3.0, 7.0]);
        assert_eq!(t.y, vec![4.0, 5.0, 6.0, 8.0]);
        assert_eq!(t.customdata, vec![[0], [1], [2], [3]]);
    }

    #[test]
    fn unequal_coordinates_are_cut_to_shortest() {
        let fig = json!({ "data": [ { "x": [1, 2], "y": [3], "customdata": [[0], [1]] } ] });
        let ScatterState::Initialized(fig) = ScatterState::from_figure_json(&fig) else {
            panic!("customdata present, plot must count as initialized");
        };
        let t = fig.primary().unwrap();
        assert_eq!(t.x, vec![1.0]);
        assert_eq!(t.y, vec![3.0]);
        assert_eq!(t.customdata, vec![[0]]);
    }

    #[test]
    fn only_missing_or_non_list_customdata_means_uninitialized() {
        for trace in [
            json!({ "x": [1], "y": [2] }),
            json!({ "x": [1], "y": [2], "customdata": null }),
            json!({ "x": [1], "y": [2], "customdata": "0" }),
        ] {
            let fig = json!({ "data": [trace] });
            assert_eq!(ScatterState::from_figure_json(&fig), ScatterState::Uninitialized);
        }
        let empty = json!({ "data": [ { "x": [], "y": [], "customdata": [] } ] });
        assert!(matches!(
            ScatterState::from_figure_json(&empty),
            ScatterState::Initialized(_)
        ));
    }

    #[test]
    fn integer_coercion_truncates_appended_points() {
        let mut state = ScatterState::Uninitialized;
        let merger = ScatterMerger::new(CoordinateCoercion::Integer);
        merger
            .merge(&mut state, &key(), &result(vec![vec![0.9, 0.1]], Some(2)))
            .unwrap();
        merger
            .merge(&mut state, &key(), &result(vec![vec![2.7, -1.6]], Some(2)))
            .unwrap();
        let ScatterState::Initialized(fig) = &state else {
            panic!("expected initialized plot");
        };
        let t = fig.primary().unwrap();
        assert_eq!(t.x, vec![0.9, 2.0]);
        assert_eq!(t.y, vec![0.1, -1.0]);
    }

    #[test]
    fn three_component_plots_append_z() {
        let mut state = ScatterState::Uninitialized;
        let merger = ScatterMerger::default();
        merger
            .merge(&mut state, &key(), &result(vec![vec![1.0, 2.0, 3.0]], Some(3)))
            .unwrap();
        merger
            .merge(&mut state, &key(), &result(vec![vec![4.0, 5.0, 6.0]], Some(3)))
            .unwrap();
        let out = state.to_figure_json();
        assert_eq!(out["data"][0]["type"], "scatter3d");
        assert_eq!(out["data"][0]["z"], json!([3.0, 6.0]));
    }

    #[test]
    fn narrow_batches_are_rejected_without_mutation() {
        let mut state = ScatterState::Uninitialized;
        let merger = ScatterMerger::default();
        merger
            .merge(&mut state, &key(), &result(vec![vec![1.0, 2.0, 3.0]], Some(3)))
            .unwrap();
        let before = state.clone();
        let err = merger
            .merge(&mut state, &key(), &result(vec![vec![1.0, 2.0]], Some(2)))
            .unwrap_err();
        assert_eq!(err.kind(), "schema");
        assert_eq!(state, before);
    }

    #[test]
    fn multi_row_batches_append_every_row() {
        let mut state = ScatterState::Uninitialized;
        let merger = ScatterMerger::default();
        merger
            .merge(&mut state, &key(), &result(vec![vec![0.0, 0.0]], Some(2)))
            .unwrap();
        let out = merger
            .merge(
                &mut state,
                &key(),
                &result(vec![vec![1.0, 1.0], vec![2.0, 2.0], vec![3.0, 3.0]], None),
            )
            .unwrap();
        assert_eq!(out, MergeOutcome::Appended { added: 3, total: 4 });
        let ScatterState::Initialized(fig) = &state else {
            panic!("expected initialized plot");
        };
        assert_eq!(fig.primary().unwrap().customdata, vec![[0], [1], [2], [3]]);
    }

    #[test]
    fn initialization_needs_component_count() {
        let mut state = ScatterState::Uninitialized;
        let err = ScatterMerger::default()
            .merge(&mut state, &key(), &result(vec![vec![1.0, 2.0]], None))
            .unwrap_err();
        assert_eq!(err.kind(), "schema");
        assert_eq!(state, ScatterState::Uninitialized);
    }

    #[test]
    fn generator_validates_shape() {
        let m = LatentMatrix::from_rows(vec![vec![1.0, 2.0]]).unwrap();
        assert_eq!(
            generate_scatter_figure(&m, 4),
            Err(FigureError::UnsupportedComponents(4))
        );
        assert_eq!(
            generate_scatter_figure(&m, 3),
            Err(FigureError::TooFewColumns { needed: 3, found: 2 })
        );
        let empty = generate_scatter_figure(&LatentMatrix::default(), 2).unwrap();
        assert_eq!(empty.point_count(), 0);
    }

    #[test]
    fn empty_initial_plot_then_append() {
        let mut state = ScatterState::Uninitialized;
        let merger = ScatterMerger::default();
        merger
            .merge(&mut state, &key(), &result(vec![], Some(2)))
            .unwrap();
        assert!(matches!(state, ScatterState::Initialized(_)));
        merger
            .merge(&mut state, &key(), &result(vec![vec![1.0, 1.0]], None))
            .unwrap();
        assert_eq!(state.point_count(), 1);
    }

    #[test]
    fn state_round_trips_through_serde() {
        let mut state = ScatterState::Uninitialized;
        ScatterMerger::default()
            .merge(&mut state, &key(), &result(vec![vec![1.0, 2.0]], Some(2)))
            .unwrap();
        let s = serde_json::to_string(&state).unwrap();
        let back: ScatterState = serde_json::from_str(&s).unwrap();
        assert_eq!(back, state);
    }
}
