//! Per-connection state machine folding [`Command`]s into global and plot snapshots.
//!
//! The aggregator never touches the filesystem. It returns [`Action`]s and the session
//! decides how to apply them against the shared grid state.

use crate::command::{Command, X_AXIS_NAME, Y_AXIS_NAME};
use crate::{GlobalConfig, PlotRecord, PlotValue};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    /// Collecting grid-wide settings; no plot can flush yet.
    AwaitingGlobal,
    /// Global boundary passed; the working record holds no values.
    AwaitingPlot,
    AccumulatingPlot,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// First grid declaration of this connection.
    BeginGrid { rows: u32, columns: u32 },
    /// Global boundary; only the first caller across the grid persists it.
    SaveGlobal(GlobalConfig),
    /// `duplicate` is set when this connection already flushed the same plot number.
    FlushPlot { record: PlotRecord, duplicate: bool },
}

#[derive(Debug, Clone, Default)]
struct WorkingRecord {
    plot_number: Option<u32>,
    plot_name: String,
    x_axis_name: Option<String>,
    y_axis_name: Option<String>,
    attributes: BTreeMap<String, String>,
    values: Vec<PlotValue>,
    commands: Vec<String>,
}

impl WorkingRecord {
    fn named(number: Option<u32>, name: String) -> Self {
        Self {
            plot_number: number,
            plot_name: name,
            ..Self::default()
        }
    }
}

pub struct PlotAggregator {
    plot_area: u32,
    state: AggregatorState,
    global: GlobalConfig,
    working: WorkingRecord,
    plot_title: String,
    flushed: BTreeSet<u32>,
    grid_declared: bool,
    initialized: bool,
    status_enabled: bool,
}

impl PlotAggregator {
    pub fn new(plot_area: u32) -> Self {
        Self {
            plot_area,
            state: AggregatorState::AwaitingGlobal,
            global: GlobalConfig::default(),
            working: WorkingRecord::default(),
            plot_title: String::new(),
            flushed: BTreeSet::new(),
            grid_declared: false,
            initialized: false,
            status_enabled: false,
        }
    }

    pub fn plot_area(&self) -> u32 {
        self.plot_area
    }

    pub fn state(&self) -> AggregatorState {
        self.state
    }

    pub fn global(&self) -> &GlobalConfig {
        &self.global
    }

    pub fn plot_title(&self) -> &str {
        &self.plot_title
    }

    pub fn pending_values(&self) -> usize {
        self.working.values.len()
    }

    pub fn grid_declared(&self) -> bool {
        self.grid_declared
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn status_enabled(&self) -> bool {
        self.status_enabled
    }

    pub fn feed(&mut self, command: Command) -> Vec<Action> {
        let mut actions = Vec::new();
        match command {
            Command::SetGrid { rows, columns } if self.grid_declared => {
                // Repeats only matter before the global boundary is written.
                if self.state == AggregatorState::AwaitingGlobal {
                    self.global.grid_rows = rows;
                    self.global.grid_columns = columns;
                }
            }
            Command::SetGrid { rows, columns } => {
                self.grid_declared = true;
                self.global = GlobalConfig::with_grid(rows, columns);
                self.working = WorkingRecord::default();
                self.plot_title.clear();
                self.flushed.clear();
                self.state = AggregatorState::AwaitingGlobal;
                actions.push(Action::BeginGrid { rows, columns });
            }
            Command::SetFrameTitle(title) => {
                self.global.frame_title = Some(title);
            }
            Command::SetGraph(graph) => {
                self.global.graph_type = Some(graph);
            }
            Command::SetPlotTitle(title) => {
                self.plot_title = title;
                if self.state == AggregatorState::AwaitingGlobal {
                    self.working = WorkingRecord::default();
                    self.state = AggregatorState::AwaitingPlot;
                    actions.push(Action::SaveGlobal(self.global.clone()));
                }
            }
            Command::SetPlotName { number, name } => {
                if self.state != AggregatorState::AwaitingGlobal {
                    actions.extend(self.flush());
                    self.state = AggregatorState::AwaitingPlot;
                }
                self.working = WorkingRecord::named(number, name);
            }
            Command::SetKeyValue { key, value } => self.set_field(key, value),
            Command::Init => {
                self.initialized = true;
                self.working.commands.push("init".to_string());
            }
            Command::AddPlot => {
                // The listening port, not the client, decides which cell this is.
                self.working
                    .commands
                    .push(format!("set plot_grid={}", self.plot_area));
                self.working.commands.push("add_plot".to_string());
            }
            Command::PlotValueTriple { plot_index, x, y } => {
                self.push_values([PlotValue::Triple(plot_index, x, y)]);
            }
            Command::PlotValueList(values) => {
                self.push_values(
                    values
                        .into_iter()
                        .enumerate()
                        .map(|(index, value)| PlotValue::Scalar(index as i64, value)),
                );
            }
            Command::Clear(plot_index) | Command::Replot(plot_index) => {
                self.working
                    .values
                    .retain(|value| value.plot_index() != plot_index);
                if self.state == AggregatorState::AccumulatingPlot && self.working.values.is_empty() {
                    self.state = AggregatorState::AwaitingPlot;
                }
            }
            Command::EnableStatus(enabled) => {
                self.status_enabled = enabled;
            }
            Command::Flush => {
                if self.state != AggregatorState::AwaitingGlobal {
                    if let Some(action) = self.flush() {
                        actions.push(action);
                        self.state = AggregatorState::AwaitingPlot;
                    }
                }
            }
            Command::Raw(line) => {
                self.working.commands.push(line);
            }
            Command::Comment | Command::Malformed(_) => {}
        }
        actions
    }

    fn set_field(&mut self, key: String, value: String) {
        if self.state == AggregatorState::AwaitingGlobal {
            self.global.extra.insert(key, value);
            return;
        }
        match key.as_str() {
            X_AXIS_NAME => self.working.x_axis_name = Some(value),
            Y_AXIS_NAME => self.working.y_axis_name = Some(value),
            _ => {
                self.working.attributes.insert(key, value);
            }
        }
    }

    fn push_values(&mut self, values: impl IntoIterator<Item = PlotValue>) {
        self.working.values.extend(values);
        if self.state == AggregatorState::AwaitingPlot && !self.working.values.is_empty() {
            self.state = AggregatorState::AccumulatingPlot;
        }
    }

    /// Hands out the working record if it holds values. Its identity and settings stay
    /// in place, so a second flush of the same plot is reported as a duplicate.
    fn flush(&mut self) -> Option<Action> {
        if self.working.values.is_empty() {
            return None;
        }
        let plot_number = match self.working.plot_number {
            Some(number) => number,
            None => {
                let next = self.flushed.last().map_or(0, |last| last.saturating_add(1));
                self.working.plot_number = Some(next);
                next
            }
        };
        let duplicate = !self.flushed.insert(plot_number);
        let plot_name = if self.working.plot_name.is_empty() {
            plot_number.to_string()
        } else {
            self.working.plot_name.clone()
        };
        let record = PlotRecord {
            plot_area: self.plot_area,
            plot_number,
            plot_title: self.plot_title.clone(),
            plot_name,
            x_axis_name: self.working.x_axis_name.clone(),
            y_axis_name: self.working.y_axis_name.clone(),
            graph: self.global.graph_type,
            plot_values: std::mem::take(&mut self.working.values),
            commands: std::mem::take(&mut self.working.commands),
            attributes: self.working.attributes.clone(),
        };
        Some(Action::FlushPlot { record, duplicate })
    }
}
