// src/web/commands.rs - Operator commands on the UI channel
use std::str::FromStr;
use thiserror::Error;

use crate::calibration::PinId;
use crate::geometry::FaceSide;

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("velocity must be positive, got '{0}'")]
    InvalidVelocity(String),
    #[error("unknown side '{0}'")]
    InvalidSide(String),
    #[error("invalid pin '{0}'")]
    InvalidPin(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiCommand {
    Start,
    Stop,
    Jog { x: f64, y: f64, z: f64, velocity: Option<f64> },
    Head(FaceSide),
    Latch(FaceSide),
    Load { recipe: String, line: Option<usize> },
    Status,
    Calibrate(PinId),
    Shutdown,
}

impl FromStr for UiCommand {
    type Err = CommandError;

    /// Words are whitespace separated; the command word is case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = s.split_whitespace().collect();
        let (name, args) = words.split_first().ok_or(CommandError::Empty)?;
        let command = match name.to_ascii_lowercase().as_str() {
            "start" => no_args(args, "start", UiCommand::Start)?,
            "stop" => no_args(args, "stop", UiCommand::Stop)?,
            "status" => no_args(args, "status", UiCommand::Status)?,
            "shutdown" => no_args(args, "shutdown", UiCommand::Shutdown)?,
            "jog" => {
                const USAGE: &str = "jog <x> <y> <z> [velocity]";
                if !(3..=4).contains(&args.len()) {
                    return Err(CommandError::Usage(USAGE));
                }
                UiCommand::Jog {
                    x: number(args[0])?,
                    y: number(args[1])?,
                    z: number(args[2])?,
                    velocity: args.get(3).map(|v| velocity(v)).transpose()?,
                }
            }
            "head" => UiCommand::Head(side(args, "head <side>")?),
            "latch" => UiCommand::Latch(side(args, "latch <side>")?),
            "load" => {
                const USAGE: &str = "load <recipe> [line]";
                match args {
                    [recipe] => UiCommand::Load { recipe: recipe.to_string(), line: None },
                    [recipe, line] => UiCommand::Load {
                        recipe: recipe.to_string(),
                        line: Some(line.parse().map_err(|_| CommandError::InvalidNumber(line.to_string()))?),
                    },
                    _ => return Err(CommandError::Usage(USAGE)),
                }
            }
            "calibrate" => match args {
                [pin] => UiCommand::Calibrate(pin.parse().map_err(|_| CommandError::InvalidPin(pin.to_string()))?),
                _ => return Err(CommandError::Usage("calibrate <pin>")),
            },
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(command)
    }
}

fn no_args(args: &[&str], usage: &'static str, command: UiCommand) -> Result<UiCommand, CommandError> {
    if args.is_empty() { Ok(command) } else { Err(CommandError::Usage(usage)) }
}

fn number(word: &str) -> Result<f64, CommandError> {
    match word.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(CommandError::InvalidNumber(word.to_string())),
    }
}

fn velocity(word: &str) -> Result<f64, CommandError> {
    let value = number(word)?;
    if value <= 0.0 {
        return Err(CommandError::InvalidVelocity(word.to_string()));
    }
    Ok(value)
}

fn side(args: &[&str], usage: &'static str) -> Result<FaceSide, CommandError> {
    match args {
        [word] => word.parse().map_err(|_| CommandError::InvalidSide(word.to_string())),
        _ => Err(CommandError::Usage(usage)),
    }
}
