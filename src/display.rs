// Copyright 2020-2022 The NATS Authors
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::convert::Infallible;
use std::fmt;
use std::io::{self, Error, ErrorKind, Write};
use std::str::FromStr;

use owo_colors::{AnsiColors, OwoColorize, Style};
use serde_json::{Map, Value};

/// Subject column width before any longer subject has been seen.
pub const DEFAULT_PADDING_SIZE: usize = 20;

/// Column width of the `time` field in `docker-logs` mode.
pub const TIMESTAMP_PADDING_SIZE: usize = 30;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// How the payload of a message is turned into text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// The payload as text.
    Raw,

    /// A JSON object carrying `time` and `text`, as emitted by Docker's
    /// NATS logging driver.
    DockerLogs,

    /// Any other format name. Parsing never fails so that a bad name is
    /// only reported once a message has to be rendered.
    Unsupported(String),
}

impl FromStr for OutputFormat {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "raw" => OutputFormat::Raw,
            "docker-logs" => OutputFormat::DockerLogs,
            other => OutputFormat::Unsupported(other.to_string()),
        })
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Raw => f.write_str("raw"),
            OutputFormat::DockerLogs => f.write_str("docker-logs"),
            OutputFormat::Unsupported(name) => f.write_str(name),
        }
    }
}

/// Renders messages as lines whose `|` separators line up.
///
/// The subject column grows to the longest subject seen so far and never
/// shrinks. Lines already written are not realigned.
#[derive(Debug)]
pub struct Engine {
    format: OutputFormat,
    longest_subject_len: usize,
    show_timestamp: bool,
    color: bool,
}

impl Engine {
    /// Creates an engine with colored subjects and the default column width.
    pub fn new(format: OutputFormat, show_timestamp: bool) -> Engine {
        Engine {
            format,
            longest_subject_len: DEFAULT_PADDING_SIZE,
            show_timestamp,
            color: true,
        }
    }

    /// Turns ANSI coloring of subjects on or off.
    pub fn with_color(mut self, color: bool) -> Engine {
        self.color = color;
        self
    }

    /// The format this engine renders with.
    pub fn format(&self) -> &OutputFormat {
        &self.format
    }

    /// Width of the subject column, in bytes.
    pub fn longest_subject_len(&self) -> usize {
        self.longest_subject_len
    }

    /// Writes one line for a message to `out`.
    ///
    /// A payload that is not a JSON object in `docker-logs` mode yields an
    /// uncolored line with the parse error and is not an error. An
    /// unsupported format fails with `InvalidInput` and writes nothing.
    pub fn render(&mut self, subject: &str, payload: &[u8], out: &mut impl Write) -> io::Result<()> {
        self.longest_subject_len = self.longest_subject_len.max(subject.len());
        let padding = " ".repeat(self.longest_subject_len - subject.len());

        let line = match &self.format {
            OutputFormat::Raw => {
                let text = String::from_utf8_lossy(payload);
                format!("{}{} | {}", self.colorize(subject), padding, chomp(&text))
            }
            OutputFormat::DockerLogs => {
                let entry = match serde_json::from_slice::<Map<String, Value>>(payload) {
                    Ok(entry) => entry,
                    Err(err) => {
                        return writeln!(out, "{}{} | {}", subject, padding, err);
                    }
                };
                let text = field(&entry, "text");
                if self.show_timestamp {
                    format!(
                        "{}{} | {:<width$} -- {}",
                        self.colorize(subject),
                        padding,
                        field(&entry, "time"),
                        chomp(&text),
                        width = TIMESTAMP_PADDING_SIZE,
                    )
                } else {
                    format!("{}{} | {}", self.colorize(subject), padding, chomp(&text))
                }
            }
            OutputFormat::Unsupported(name) => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("unsupported output format: {}", name),
                ));
            }
        };

        writeln!(out, "{}", line)
    }

    fn colorize(&self, subject: &str) -> String {
        if !self.color {
            return subject.to_string();
        }
        let style = Style::new().color(palette(color_index(subject))).bold();
        subject.style(style).to_string()
    }
}

/// Picks one of six colors for a subject: the FNV-1a hash of its bytes
/// modulo 6, plus one. Always in `1..=6`.
pub fn color_index(subject: &str) -> u32 {
    let hash = subject.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    });
    hash % 6 + 1
}

fn palette(index: u32) -> AnsiColors {
    match index {
        1 => AnsiColors::Red,
        2 => AnsiColors::Green,
        3 => AnsiColors::Yellow,
        4 => AnsiColors::Blue,
        5 => AnsiColors::Magenta,
        _ => AnsiColors::Cyan,
    }
}

/// Strings are shown bare, absent keys as nothing and other values as JSON.
fn field(entry: &Map<String, Value>, key: &str) -> String {
    match entry.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(value) => value.to_string(),
        None => String::new(),
    }
}

fn chomp(text: &str) -> &str {
    text.strip_suffix('\n').unwrap_or(text)
}
