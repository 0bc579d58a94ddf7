//! Progress protocol types shared by handles, the coordinator and workers.
//!
//! Every type here is rkyv-archivable so that worker processes can send
//! the same requests over their IPC pipe that in-process handles send
//! over a channel.

use std::fmt;
use std::str::FromStr;

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Error, Result};

/// Width that status labels are padded to in bar descriptions.
pub const STATUS_LABEL_WIDTH: usize = 16;

/// Identifier of a bar, assigned by the coordinator at creation.
///
/// Ids start at 1 and are never reused while the coordinator lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Archive, Serialize, Deserialize)]
pub struct BarId(pub u64);

impl fmt::Display for BarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bar#{}", self.0)
    }
}

/// Identifier of a registered handle (one reply channel each).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Archive, Serialize, Deserialize)]
pub struct RequesterId(pub u64);

/// Bar colour: a fixed named palette or a 24-bit hex value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum Colour {
    Black,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    White,
    Rgb(u8, u8, u8),
}

impl FromStr for Colour {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if let Some(hex) = trimmed.strip_prefix('#') {
            if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::InvalidColour(s.to_string()));
            }
            let channel = |i: usize| {
                u8::from_str_radix(&hex[i..i + 2], 16)
                    .map_err(|_| Error::InvalidColour(s.to_string()))
            };
            return Ok(Colour::Rgb(channel(0)?, channel(2)?, channel(4)?));
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "black" => Ok(Colour::Black),
            "red" => Ok(Colour::Red),
            "green" => Ok(Colour::Green),
            "yellow" => Ok(Colour::Yellow),
            "blue" => Ok(Colour::Blue),
            "magenta" => Ok(Colour::Magenta),
            "cyan" => Ok(Colour::Cyan),
            "white" => Ok(Colour::White),
            _ => Err(Error::InvalidColour(s.to_string())),
        }
    }
}

impl fmt::Display for Colour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Colour::Black => f.write_str("black"),
            Colour::Red => f.write_str("red"),
            Colour::Green => f.write_str("green"),
            Colour::Yellow => f.write_str("yellow"),
            Colour::Blue => f.write_str("blue"),
            Colour::Magenta => f.write_str("magenta"),
            Colour::Cyan => f.write_str("cyan"),
            Colour::White => f.write_str("white"),
            Colour::Rgb(r, g, b) => write!(f, "#{:02x}{:02x}{:02x}", r, g, b),
        }
    }
}

/// Options a bar is created with.
///
/// Lower `priority` renders higher on screen. Bars without an explicit
/// priority sort after every prioritized bar.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct BarOptions {
    /// Expected count, `None` for an open-ended counter.
    pub total: Option<u64>,
    /// Text shown before the bar.
    pub description: String,
    /// Bar colour, terminal default when `None`.
    pub colour: Option<Colour>,
    /// Render order key, lower first.
    pub priority: f64,
    /// Minimum seconds between update-driven renders.
    pub min_interval: f64,
    /// Maximum seconds a bar goes without being redrawn.
    pub max_interval: f64,
    /// Unit label used in the counter and rate.
    pub unit: String,
    /// Keep the final line on screen after close.
    pub leave: bool,
    /// Fixed bar cell count; the bar fills the line when `None`.
    pub width: Option<u16>,
}

impl Default for BarOptions {
    fn default() -> Self {
        Self {
            total: None,
            description: String::new(),
            colour: None,
            priority: f64::INFINITY,
            min_interval: 0.1,
            max_interval: 10.0,
            unit: "it".to_string(),
            leave: false,
            width: None,
        }
    }
}

impl BarOptions {
    /// Options with the given description.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    /// Defaults for an executor's top-level aggregate bar.
    pub fn overall() -> Self {
        Self {
            description: status_label("Processing..."),
            colour: Some(Colour::Cyan),
            priority: 1.0,
            min_interval: 1.0 / 15.0,
            max_interval: 1.0 / 10.0,
            leave: true,
            ..Self::default()
        }
    }

    pub fn total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    pub fn colour(mut self, colour: Colour) -> Self {
        self.colour = Some(colour);
        self
    }

    pub fn priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn refresh_interval(mut self, min: f64, max: f64) -> Self {
        self.min_interval = min;
        self.max_interval = max;
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn leave(mut self, leave: bool) -> Self {
        self.leave = leave;
        self
    }

    pub fn width(mut self, width: u16) -> Self {
        self.width = Some(width);
        self
    }
}

/// Pad a status word to the shared label width.
pub fn status_label(text: &str) -> String {
    format!("{:<width$}", text, width = STATUS_LABEL_WIDTH)
}

/// Readable bar attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum BarAttr {
    Total,
    Count,
    Description,
    Colour,
    Priority,
    Position,
}

/// Value of one bar attribute, used by both `GetAttr` replies and `SetAttr`.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum BarValue {
    Total(Option<u64>),
    Count(u64),
    Description(String),
    Colour(Option<Colour>),
    Priority(f64),
    Position(Option<u64>),
}

/// Operation carried by a [`ProgressRequest`].
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum ProgressOp {
    /// Allocate a new bar.
    Create(BarOptions),
    /// Advance the counter.
    Update { delta: u64 },
    /// Close and discard the bar.
    Close,
    /// Zero the counter and optionally replace the total.
    Reset { total: Option<u64> },
    SetDescription(String),
    SetColour(Option<Colour>),
    GetAttr(BarAttr),
    SetAttr(BarValue),
    /// Print a line above the bars.
    Write(String),
    /// Stop the coordinator. Only the owning executor sends this.
    Exit,
}

impl ProgressOp {
    /// Short name used in logs and statistics.
    pub fn name(&self) -> &'static str {
        match self {
            ProgressOp::Create(_) => "create",
            ProgressOp::Update { .. } => "update",
            ProgressOp::Close => "close",
            ProgressOp::Reset { .. } => "reset",
            ProgressOp::SetDescription(_) => "set_description",
            ProgressOp::SetColour(_) => "set_colour",
            ProgressOp::GetAttr(_) => "get_attr",
            ProgressOp::SetAttr(_) => "set_attr",
            ProgressOp::Write(_) => "write",
            ProgressOp::Exit => "exit",
        }
    }
}

/// A message from any handle to the coordinator.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct ProgressRequest {
    /// Handle whose reply channel receives the response.
    pub requester: RequesterId,
    /// Target bar, `None` for bar-less operations (create, write, exit).
    pub bar: Option<BarId>,
    pub op: ProgressOp,
}

/// Reply correlated 1:1 with a [`ProgressRequest`].
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum ProgressResponse {
    Ack,
    Created(BarId),
    Value(BarValue),
    UnknownBar(BarId),
    Rejected(String),
}
