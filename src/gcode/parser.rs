// src/gcode/parser.rs - Line parser for winder recipes
//! Turns one line of recipe text into a [`GCodeLine`].
//!
//! Words are a letter followed by a signed decimal (`X-12.5`, `G102`).
//! Parameters (`P Q R I J`, and `F`/`B` pins inside `G108`) belong to the
//! function code before them. `( ... )` and `;` comments are dropped.
//!
//! The parser only remembers the previous line number, so the same text
//! always parses to the same lines.

use std::fmt;
use thiserror::Error;

use super::command::{Command, GCodeLine, PartialLocation};
use crate::geometry::{FaceSide, TransferEdge};

#[derive(Debug, Error, Clone, PartialEq)]
#[error("line {line}, column {column}: {reason}")]
pub struct ParseError {
    pub line: usize,
    /// 1-based character column.
    pub column: usize,
    pub reason: ParseReason,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseReason {
    #[error("malformed number '{0}'")]
    MalformedNumber(String),
    #[error("unexpected character '{0}'")]
    UnexpectedCharacter(char),
    #[error("unknown word letter '{0}'")]
    UnknownLetter(char),
    #[error("duplicate '{0}' word")]
    DuplicateWord(char),
    #[error("more than one motion code on the line")]
    DuplicateMotion,
    #[error("parameter '{0}' without a function code")]
    ParameterWithoutFunction(char),
    #[error("{function} does not take '{letter}'")]
    UnexpectedParameter { function: &'static str, letter: char },
    #[error("{function} requires '{letter}'")]
    MissingParameter { function: &'static str, letter: char },
    #[error("{function} given '{letter}' twice")]
    DuplicateParameter { function: &'static str, letter: char },
    #[error("{function} has invalid '{letter}' value {value}")]
    InvalidParameter { function: &'static str, letter: char, value: String },
    #[error("unknown function code {0}")]
    UnknownFunction(String),
    #[error("invalid line number '{0}'")]
    InvalidLineNumber(String),
    #[error("line number {found} does not follow {previous}")]
    LineNumberRegression { previous: u32, found: u32 },
    #[error("feed must be positive, got {0}")]
    NonPositiveFeed(f64),
    #[error("unterminated comment")]
    UnterminatedComment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionCode {
    Move,
    Delay,
    Latch,
    SeekTransfer,
    Clip,
    HeadLocation,
    PinPositioning,
    Break,
}

impl FunctionCode {
    fn lookup(letter: char, code: u32) -> Option<Self> {
        let function = match (letter, code) {
            ('G', 0) | ('G', 1) => FunctionCode::Move,
            ('G', 4) => FunctionCode::Delay,
            ('G', 100) => FunctionCode::Latch,
            ('G', 102) => FunctionCode::SeekTransfer,
            ('G', 104) => FunctionCode::Clip,
            ('G', 106) => FunctionCode::HeadLocation,
            ('G', 108) => FunctionCode::PinPositioning,
            ('M', 0) => FunctionCode::Break,
            _ => return None,
        };
        Some(function)
    }

    fn name(self) -> &'static str {
        match self {
            FunctionCode::Move => "G1",
            FunctionCode::Delay => "G4",
            FunctionCode::Latch => "G100",
            FunctionCode::SeekTransfer => "G102",
            FunctionCode::Clip => "G104",
            FunctionCode::HeadLocation => "G106",
            FunctionCode::PinPositioning => "G108",
            FunctionCode::Break => "M0",
        }
    }

    fn accepts(self, letter: char) -> bool {
        match self {
            FunctionCode::Delay | FunctionCode::Latch | FunctionCode::SeekTransfer | FunctionCode::HeadLocation => {
                letter == 'P'
            }
            FunctionCode::PinPositioning => matches!(letter, 'F' | 'B' | 'I' | 'J'),
            FunctionCode::Move | FunctionCode::Clip | FunctionCode::Break => false,
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
struct Word {
    letter: char,
    raw: String,
    value: f64,
    column: usize,
}

#[derive(Debug)]
struct FunctionGroup {
    code: FunctionCode,
    column: usize,
    params: Vec<Word>,
}

#[derive(Debug)]
enum Slot {
    Move,
    Function(FunctionGroup),
}

/// Stateful only in the last line number seen.
#[derive(Debug, Clone, Default)]
pub struct GCodeParser {
    last_number: Option<u32>,
}

impl GCodeParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a whole program, numbering source lines from 1.
    pub fn parse_program(text: &str) -> Result<Vec<GCodeLine>, ParseError> {
        let mut parser = GCodeParser::new();
        let mut lines = Vec::new();
        for (index, text) in text.lines().enumerate() {
            if let Some(line) = parser.parse_line(text, index + 1)? {
                lines.push(line);
            }
        }
        Ok(lines)
    }

    /// Parse one line. Blank and comment-only lines yield `None` and do not
    /// consume a line number.
    pub fn parse_line(&mut self, text: &str, source_line: usize) -> Result<Option<GCodeLine>, ParseError> {
        let error = |column: usize, reason: ParseReason| ParseError { line: source_line, column, reason };

        let words = tokenize(text).map_err(|(column, reason)| error(column, reason))?;
        if words.is_empty() {
            return Ok(None);
        }

        let mut number: Option<(u32, usize)> = None;
        let mut feed: Option<f64> = None;
        let mut target = PartialLocation::default();
        let mut slots: Vec<Slot> = Vec::new();
        let mut open: Option<usize> = None;
        let mut has_move = false;

        for word in words {
            let in_pin_group = matches!(
                open.and_then(|index| slots.get(index)),
                Some(Slot::Function(FunctionGroup { code: FunctionCode::PinPositioning, .. }))
            );

            match word.letter {
                'N' => {
                    if number.is_some() {
                        return Err(error(word.column, ParseReason::DuplicateWord('N')));
                    }
                    let value = whole_number(&word)
                        .and_then(|n| u32::try_from(n).ok())
                        .ok_or_else(|| error(word.column, ParseReason::InvalidLineNumber(word.raw.clone())))?;
                    number = Some((value, word.column));
                }
                'X' | 'Y' | 'Z' => {
                    let axis = match word.letter {
                        'X' => &mut target.x,
                        'Y' => &mut target.y,
                        _ => &mut target.z,
                    };
                    if axis.is_some() {
                        return Err(error(word.column, ParseReason::DuplicateWord(word.letter)));
                    }
                    *axis = Some(word.value);
                    if !has_move {
                        slots.push(Slot::Move);
                        has_move = true;
                    }
                }
                'F' | 'B' if in_pin_group => push_param(&mut slots, open, word),
                'F' => {
                    if feed.is_some() {
                        return Err(error(word.column, ParseReason::DuplicateWord('F')));
                    }
                    if word.value <= 0.0 {
                        return Err(error(word.column, ParseReason::NonPositiveFeed(word.value)));
                    }
                    feed = Some(word.value);
                }
                'P' | 'Q' | 'R' | 'I' | 'J' => {
                    if open.is_none() {
                        return Err(error(word.column, ParseReason::ParameterWithoutFunction(word.letter)));
                    }
                    push_param(&mut slots, open, word);
                }
                'G' | 'M' => {
                    let code = whole_number(&word)
                        .and_then(|n| u32::try_from(n).ok())
                        .and_then(|n| FunctionCode::lookup(word.letter, n))
                        .ok_or_else(|| {
                            error(word.column, ParseReason::UnknownFunction(format!("{}{}", word.letter, word.raw)))
                        })?;
                    if code == FunctionCode::Move {
                        if slots.iter().any(|slot| matches!(slot, Slot::Function(g) if g.code == FunctionCode::Move)) {
                            return Err(error(word.column, ParseReason::DuplicateMotion));
                        }
                        // A G1 after axis words takes over the modal move's slot.
                        if has_move {
                            slots.retain(|slot| !matches!(slot, Slot::Move));
                        }
                        has_move = true;
                    }
                    slots.push(Slot::Function(FunctionGroup { code, column: word.column, params: Vec::new() }));
                    open = Some(slots.len() - 1);
                }
                other => return Err(error(word.column, ParseReason::UnknownLetter(other))),
            }
        }

        let number = match number {
            Some((value, column)) => match self.last_number {
                Some(previous) if value <= previous => {
                    return Err(error(column, ParseReason::LineNumberRegression { previous, found: value }));
                }
                _ => value,
            },
            None => match self.last_number {
                Some(previous) => previous.checked_add(1).ok_or_else(|| {
                    error(1, ParseReason::LineNumberRegression { previous, found: previous })
                })?,
                None => 1,
            },
        };

        let mut commands = Vec::with_capacity(slots.len());
        for slot in slots {
            let command = match slot {
                Slot::Move => Command::Move { target, feed },
                Slot::Function(group) => {
                    finish_group(group, target, feed).map_err(|(column, reason)| error(column, reason))?
                }
            };
            commands.push(command);
        }

        self.last_number = Some(number);
        Ok(Some(GCodeLine { number, feed, commands, source: source_line }))
    }
}

fn push_param(slots: &mut [Slot], open: Option<usize>, word: Word) {
    if let Some(Slot::Function(group)) = open.and_then(|index| slots.get_mut(index)) {
        group.params.push(word);
    }
}

fn whole_number(word: &Word) -> Option<i64> {
    if word.raw.contains('.') || word.value.fract() != 0.0 || word.value.abs() > i64::MAX as f64 {
        return None;
    }
    Some(word.value as i64)
}

fn tokenize(text: &str) -> Result<Vec<Word>, (usize, ParseReason)> {
    let chars: Vec<char> = text.chars().collect();
    let mut words = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == ';' {
            break;
        }
        if c == '(' {
            match chars[i + 1..].iter().position(|&c| c == ')') {
                Some(offset) => {
                    i += offset + 2;
                    continue;
                }
                None => return Err((i + 1, ParseReason::UnterminatedComment)),
            }
        }
        if c.is_ascii_alphabetic() {
            let start = i + 1;
            let mut end = start;
            while end < chars.len() && (chars[end].is_ascii_digit() || matches!(chars[end], '.' | '+' | '-')) {
                end += 1;
            }
            let raw: String = chars[start..end].iter().collect();
            let value = parse_number(&raw).ok_or_else(|| (i + 1, ParseReason::MalformedNumber(raw.clone())))?;
            words.push(Word { letter: c.to_ascii_uppercase(), raw, value, column: i + 1 });
            i = end;
            continue;
        }
        return Err((i + 1, ParseReason::UnexpectedCharacter(c)));
    }
    Ok(words)
}

/// `[+-]?(digits[.digits] | .digits)`; no exponents, no `inf`/`nan`.
fn parse_number(raw: &str) -> Option<f64> {
    let body = raw.strip_prefix(['+', '-']).unwrap_or(raw);
    let (int, frac) = match body.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (body, None),
    };
    let digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if !digits(int) || !frac.is_none_or(digits) {
        return None;
    }
    if int.is_empty() && frac.is_none_or(str::is_empty) {
        return None;
    }
    raw.parse().ok()
}

type GroupError = (usize, ParseReason);

fn finish_group(group: FunctionGroup, target: PartialLocation, feed: Option<f64>) -> Result<Command, GroupError> {
    let function = group.code.name();
    let mut seen: Vec<char> = Vec::new();
    for param in &group.params {
        if !group.code.accepts(param.letter) {
            return Err((param.column, ParseReason::UnexpectedParameter { function, letter: param.letter }));
        }
        if seen.contains(&param.letter) {
            return Err((param.column, ParseReason::DuplicateParameter { function, letter: param.letter }));
        }
        seen.push(param.letter);
    }

    let param = |letter: char| group.params.iter().find(|p| p.letter == letter);
    let required = |letter: char| {
        param(letter).ok_or((group.column, ParseReason::MissingParameter { function, letter }))
    };
    let invalid = |word: &Word| {
        (word.column, ParseReason::InvalidParameter { function, letter: word.letter, value: word.raw.clone() })
    };
    let side = |word: &Word| whole_number(word).and_then(FaceSide::from_code).ok_or_else(|| invalid(word));

    let command = match group.code {
        FunctionCode::Move => Command::Move { target, feed },
        FunctionCode::Delay => {
            let p = required('P')?;
            let ms = whole_number(p).and_then(|n| u64::try_from(n).ok()).ok_or_else(|| invalid(p))?;
            Command::Delay(ms)
        }
        FunctionCode::Latch => Command::Latch(side(required('P')?)?),
        FunctionCode::HeadLocation => Command::HeadLocation(side(required('P')?)?),
        FunctionCode::SeekTransfer => {
            let p = required('P')?;
            let edge = whole_number(p).and_then(TransferEdge::from_mask).ok_or_else(|| invalid(p))?;
            Command::SeekTransfer(edge)
        }
        FunctionCode::PinPositioning => {
            let pin = |letter: char| -> Result<Option<u32>, GroupError> {
                match param(letter) {
                    Some(word) => whole_number(word)
                        .and_then(|n| u32::try_from(n).ok())
                        .filter(|&n| n >= 1)
                        .map(Some)
                        .ok_or_else(|| invalid(word)),
                    None => Ok(None),
                }
            };
            let front = pin('F')?;
            let back = pin('B')?;
            if front.is_none() && back.is_none() {
                return Err((group.column, ParseReason::MissingParameter { function, letter: 'F' }));
            }
            Command::PinPositioning {
                front,
                back,
                offset_x: param('I').map_or(0.0, |w| w.value),
                offset_y: param('J').map_or(0.0, |w| w.value),
            }
        }
        FunctionCode::Clip => Command::Clip,
        FunctionCode::Break => Command::Break,
    };
    Ok(command)
}
