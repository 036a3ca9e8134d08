pub mod aggregator;
pub mod command;
pub mod protocol;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Keys written by [`GlobalConfig`] itself; extra settings never shadow them.
const RESERVED_GLOBAL_KEYS: &[&str] = &["grid", "grid_rows", "grid_columns", "frame_title", "graph"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GraphType {
    Time,
    Bar,
    Xy,
    Dial,
}

impl GraphType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphType::Time => "time",
            GraphType::Bar => "bar",
            GraphType::Xy => "xy",
            GraphType::Dial => "dial",
        }
    }
}

impl fmt::Display for GraphType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GraphType {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "time" => Ok(GraphType::Time),
            "bar" => Ok(GraphType::Bar),
            "xy" => Ok(GraphType::Xy),
            "dial" => Ok(GraphType::Dial),
            other => Err(format!("Unknown graph type: {other}")),
        }
    }
}

/// Grid-wide settings, persisted once per grid lifecycle as `global_config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfig {
    pub grid_rows: u32,
    pub grid_columns: u32,
    pub frame_title: Option<String>,
    pub graph_type: Option<GraphType>,
    /// Global `set` keys seen before the global boundary (legend, colours, ...).
    pub extra: BTreeMap<String, String>,
}

impl GlobalConfig {
    pub fn with_grid(rows: u32, columns: u32) -> Self {
        Self {
            grid_rows: rows,
            grid_columns: columns,
            ..Self::default()
        }
    }

    pub fn cell_count(&self) -> u32 {
        self.grid_rows.saturating_mul(self.grid_columns)
    }
}

// The viewer reads `grid` as a `[rows, columns]` pair and spreads every other key into
// its layout, so the document is written by hand rather than derived.
impl Serialize for GlobalConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("grid", &[self.grid_rows, self.grid_columns])?;
        map.serialize_entry("grid_rows", &self.grid_rows)?;
        map.serialize_entry("grid_columns", &self.grid_columns)?;
        if let Some(title) = &self.frame_title {
            map.serialize_entry("frame_title", title)?;
        }
        if let Some(graph) = &self.graph_type {
            map.serialize_entry("graph", graph)?;
        }
        for (key, value) in &self.extra {
            if RESERVED_GLOBAL_KEYS.contains(&key.as_str()) {
                continue;
            }
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// One persisted value. Triples serialize as `[index, x, y]`, list entries as
/// `[index, value]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PlotValue {
    Triple(i64, f64, f64),
    Scalar(i64, f64),
}

impl PlotValue {
    pub fn plot_index(&self) -> i64 {
        match self {
            PlotValue::Triple(index, _, _) | PlotValue::Scalar(index, _) => *index,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlotRecord {
    pub plot_area: u32,
    pub plot_number: u32,
    #[serde(default)]
    pub plot_title: String,
    #[serde(default)]
    pub plot_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_axis_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_axis_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphType>,
    #[serde(default)]
    pub plot_values: Vec<PlotValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    #[serde(default, flatten)]
    pub attributes: BTreeMap<String, String>,
}

impl PlotRecord {
    /// Identity of the record within a grid lifecycle.
    pub fn key(&self) -> (u32, u32) {
        (self.plot_area, self.plot_number)
    }
}
