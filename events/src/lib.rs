use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

pub const RESET_MARKER: &str = "> rr";
pub const GENERATED_MARKER: &str = "For help, type \"help\"";
pub const LOGIN_MARKER: &str = "joined the game";
pub const NETHER_MARKER: &str = "[We Need to Go Deeper]";
pub const END_MARKER: &str = "[The End?]";
pub const CREDITS_MARKER: &str = "[Credits!]";
pub const PEARL_MARKER: &str = "> pearl ";
pub const POSITION_MARKER: &str = "> pos ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Reset,
    PlayerCommand,
    PearlThrow,
    WorldGenerated,
    Login,
    Nether,
    End,
    Credits,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Reset => "reset",
            EventKind::PlayerCommand => "player-command",
            EventKind::PearlThrow => "pearl-throw",
            EventKind::WorldGenerated => "world-generated",
            EventKind::Login => "login",
            EventKind::Nether => "nether",
            EventKind::End => "end",
            EventKind::Credits => "credits",
        };
        f.write_str(name)
    }
}

/// Something a replica observed, stamped with the id of the replica that saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub replica: usize,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: String,
}

impl Event {
    pub fn new(replica: usize, timestamp: DateTime<Utc>, kind: EventKind, payload: &str) -> Self {
        Self {
            replica,
            timestamp,
            kind,
            payload: payload.to_string(),
        }
    }
}

/// One element of a `/tellraw` text component list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
    pub color: String,
}

impl ChatMessage {
    pub fn new(text: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            color: color.into(),
        }
    }

    pub fn green(text: impl Into<String>) -> Self {
        Self::new(text, "green")
    }

    /// Formats the console command broadcasting this message to every player
    pub fn to_command(&self) -> Result<String, serde_json::Error> {
        let components = serde_json::to_string(std::slice::from_ref(self))?;
        Ok(format!("/tellraw @a {}", components))
    }
}

/// A log line that matched one of the known rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: String,
}

impl LogEntry {
    pub fn into_event(self, replica: usize) -> Event {
        Event {
            replica,
            timestamp: self.timestamp,
            kind: self.kind,
            payload: self.payload,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid timestamp '{value}'")]
    Timestamp { value: String },
}

struct Rule {
    marker: &'static str,
    kind: EventKind,
    /// Chat commands carry their arguments as payload instead of the whole message
    command: bool,
}

// First match wins.
const RULES: &[Rule] = &[
    Rule { marker: RESET_MARKER, kind: EventKind::Reset, command: true },
    Rule { marker: GENERATED_MARKER, kind: EventKind::WorldGenerated, command: false },
    Rule { marker: LOGIN_MARKER, kind: EventKind::Login, command: false },
    Rule { marker: NETHER_MARKER, kind: EventKind::Nether, command: false },
    Rule { marker: END_MARKER, kind: EventKind::End, command: false },
    Rule { marker: CREDITS_MARKER, kind: EventKind::Credits, command: false },
    Rule { marker: PEARL_MARKER, kind: EventKind::PearlThrow, command: true },
    Rule { marker: POSITION_MARKER, kind: EventKind::PlayerCommand, command: true },
];

fn envelope() -> &'static Regex {
    static ENVELOPE: OnceLock<Regex> = OnceLock::new();
    ENVELOPE.get_or_init(|| {
        Regex::new(r"^\[(\d+:\d+:\d+)\] \[([\s\w/-]+)\]: (.+)$").expect("valid log envelope regex")
    })
}

/// Classifies a message body against the rule table
pub fn classify(message: &str) -> Option<(EventKind, String)> {
    RULES.iter().find_map(|rule| {
        let idx = message.find(rule.marker)?;
        let payload = if rule.command {
            message[idx + rule.marker.len()..].trim()
        } else {
            message
        };
        Some((rule.kind, payload.to_string()))
    })
}

/// Parses one line of server output.
///
/// Lines outside the `[HH:MM:SS] [thread/LEVEL]: message` envelope and
/// messages matching no rule yield `Ok(None)`. A bad time of day is an error
/// whether or not the message matches a rule. The time of day is placed on
/// `date`, since the server only prints wall-clock time.
pub fn parse_line(line: &str, date: NaiveDate) -> Result<Option<LogEntry>, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(captures) = envelope().captures(line) else {
        return Ok(None);
    };
    let (time, message) = (&captures[1], &captures[3]);

    let time = NaiveTime::parse_from_str(time, "%H:%M:%S").map_err(|_| ParseError::Timestamp {
        value: time.to_string(),
    })?;

    let Some((kind, payload)) = classify(message) else {
        return Ok(None);
    };

    Ok(Some(LogEntry {
        timestamp: date.and_time(time).and_utc(),
        kind,
        payload,
    }))
}
