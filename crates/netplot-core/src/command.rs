use crate::GraphType;
use chrono::NaiveDate;

const SET_PREFIX: &str = "set ";
const INIT: &str = "init";
const ADD_PLOT: &str = "add_plot";
const CLEAR: &str = "clear";
const REPLOT: &str = "replot";
const ENABLE_STATUS: &str = "enable_status";

pub const GRID: &str = "grid";
pub const PLOT_NAME: &str = "plot_name";
pub const PLOT_TITLE: &str = "plot_title";
pub const FRAME_TITLE: &str = "frame_title";
pub const GRAPH: &str = "graph";
pub const X_AXIS_NAME: &str = "x_axis_name";
pub const Y_AXIS_NAME: &str = "y_axis_name";

const VALUE_DELIM: char = ':';
const LIST_DELIM: char = ',';
const TIMESTAMP_DELIM: char = ';';

/// One received line, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetGrid { rows: u32, columns: u32 },
    SetPlotName { number: Option<u32>, name: String },
    SetPlotTitle(String),
    SetFrameTitle(String),
    SetGraph(GraphType),
    SetKeyValue { key: String, value: String },
    Init,
    AddPlot,
    PlotValueTriple { plot_index: i64, x: f64, y: f64 },
    PlotValueList(Vec<f64>),
    Clear(i64),
    Replot(i64),
    EnableStatus(bool),
    /// Empty line.
    Flush,
    Comment,
    /// A value triple whose numeric fields did not parse.
    Malformed(String),
    /// Anything else, kept verbatim in the record's command log.
    Raw(String),
}

/// Classify one line. Never fails: unrecognised input becomes [`Command::Raw`].
pub fn parse(line: &str) -> Command {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Command::Flush;
    }
    if line.starts_with('#') || line.starts_with('/') {
        return Command::Comment;
    }
    if let Some(rest) = line.strip_prefix(SET_PREFIX) {
        return parse_set(line, rest);
    }

    let trimmed = line.trim();
    match trimmed {
        INIT => return Command::Init,
        ADD_PLOT => return Command::AddPlot,
        _ => {}
    }
    if let Some(command) = parse_keyword(trimmed) {
        return command;
    }
    if trimmed.contains(VALUE_DELIM) {
        return parse_triple(trimmed);
    }
    if let Some(values) = parse_value_list(trimmed) {
        return Command::PlotValueList(values);
    }
    Command::Raw(line.to_string())
}

fn parse_set(line: &str, rest: &str) -> Command {
    let Some((key, value)) = rest.split_once('=') else {
        return Command::Raw(line.to_string());
    };
    let key = key.trim();
    let value = value.trim();
    if key.is_empty() {
        return Command::Raw(line.to_string());
    }

    match key {
        GRID => match parse_grid(value) {
            Some((rows, columns)) => Command::SetGrid { rows, columns },
            None => key_value(key, value),
        },
        PLOT_NAME => Command::SetPlotName {
            number: value
                .split_whitespace()
                .next()
                .and_then(|token| token.parse::<u32>().ok()),
            name: value.to_string(),
        },
        PLOT_TITLE => Command::SetPlotTitle(value.to_string()),
        FRAME_TITLE => Command::SetFrameTitle(value.to_string()),
        GRAPH => match value.parse::<GraphType>() {
            Ok(graph) => Command::SetGraph(graph),
            Err(_) => key_value(key, value),
        },
        _ => key_value(key, value),
    }
}

fn key_value(key: &str, value: &str) -> Command {
    Command::SetKeyValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_grid(value: &str) -> Option<(u32, u32)> {
    let (rows, columns) = value.split_once(LIST_DELIM)?;
    let rows = rows.trim().parse::<u32>().ok()?;
    let columns = columns.trim().parse::<u32>().ok()?;
    if rows == 0 || columns == 0 {
        return None;
    }
    Some((rows, columns))
}

fn parse_keyword(line: &str) -> Option<Command> {
    let mut tokens = line.split_whitespace();
    let keyword = tokens.next()?;
    let argument = tokens.next()?;
    if tokens.next().is_some() {
        return None;
    }
    match keyword {
        CLEAR => argument.parse::<i64>().ok().map(Command::Clear),
        REPLOT => argument.parse::<i64>().ok().map(Command::Replot),
        ENABLE_STATUS => Some(Command::EnableStatus(!matches!(
            argument.to_lowercase().as_str(),
            "0" | "false" | "no"
        ))),
        _ => None,
    }
}

fn parse_triple(line: &str) -> Command {
    let fields = line.split(VALUE_DELIM).collect::<Vec<_>>();
    if fields.len() != 3 {
        return Command::Raw(line.to_string());
    }
    let plot_index = fields[0].trim().parse::<i64>().ok();
    let x = parse_x_value(fields[1].trim());
    let y = parse_finite(fields[2].trim());
    match (plot_index, x, y) {
        (Some(plot_index), Some(x), Some(y)) => Command::PlotValueTriple { plot_index, x, y },
        _ => Command::Malformed(line.to_string()),
    }
}

fn parse_x_value(field: &str) -> Option<f64> {
    if field.contains(TIMESTAMP_DELIM) {
        parse_timestamp_ms(field)
    } else {
        parse_finite(field)
    }
}

/// `year;month;day;hour;minute;second;millisecond` (UTC) to epoch milliseconds.
fn parse_timestamp_ms(field: &str) -> Option<f64> {
    let parts = field
        .split(TIMESTAMP_DELIM)
        .map(|part| part.trim().parse::<f64>().ok())
        .collect::<Option<Vec<_>>>()?;
    if parts.len() != 7 || parts.iter().any(|part| !part.is_finite() || *part < 0.0) {
        return None;
    }
    let date = NaiveDate::from_ymd_opt(parts[0] as i32, parts[1] as u32, parts[2] as u32)?;
    let stamp = date.and_hms_milli_opt(
        parts[3] as u32,
        parts[4] as u32,
        parts[5] as u32,
        parts[6].round() as u32,
    )?;
    Some(stamp.and_utc().timestamp_millis() as f64)
}

fn parse_value_list(line: &str) -> Option<Vec<f64>> {
    let values = line
        .split(LIST_DELIM)
        .filter_map(|token| parse_finite(token.trim()))
        .collect::<Vec<_>>();
    if values.is_empty() {
        return None;
    }
    Some(values)
}

fn parse_finite(token: &str) -> Option<f64> {
    token.parse::<f64>().ok().filter(|value| value.is_finite())
}
