// Operator console for the server process.
//
// Reads one command per line and calls the matching `Server` operation:
//
//   list                     connected endpoints
//   play <file>              start playback (quote paths containing spaces)
//   stop                     stop playback
//   vol <user|all> <0-100>   set the output volume of one or every endpoint
//   help                     command summary
//   exit                     leave the console
//
// Parsing is separate from execution so it can be tested without a server.
// Volumes are range-checked here as signed numbers, so `-5` or `300` are
// refused before anything reaches the server.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use thiserror::Error;

use crate::server::{Server, VolumeTarget};

pub const PROMPT: &str = "> ";

const HELP: &str = "\
Commands:

list: Prints a list of all currently connected users.
play <file>: Starts playback of a WAV file.
stop: Stops the music playback.
vol <user|all> <volume>: Sets the system volume of a user's computer.
    If all is supplied, the volume of all connected users is changed.
exit: Exits the program.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Help,
    List,
    Play(PathBuf),
    Stop,
    Volume { target: VolumeTarget, volume: u32 },
    Exit,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Unknown command '{0}', type 'help' for a list")]
    Unknown(String),

    #[error("Args: {0}")]
    Usage(&'static str),

    #[error("Invalid volume: '{0}'")]
    InvalidVolume(String),

    #[error("Volume can't be smaller than 0")]
    VolumeTooLow,

    #[error("Volume can't be greater than 100")]
    VolumeTooHigh,
}

/// Split a line on spaces, keeping double-quoted runs together and dropping
/// the quotes.
pub fn split_args(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_arg = false;

    for c in line.trim_end_matches(['\r', '\n']).chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_arg = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            c => {
                current.push(c);
                in_arg = true;
            }
        }
    }
    if in_arg {
        args.push(current);
    }
    args
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Command>, CommandError> {
    let args = split_args(line);
    let Some((name, rest)) = args.split_first() else {
        return Ok(None);
    };

    let command = match name.to_lowercase().as_str() {
        "help" => Command::Help,
        "list" => Command::List,
        "stop" => Command::Stop,
        "exit" => Command::Exit,
        "play" => match rest.first() {
            Some(path) => Command::Play(PathBuf::from(path)),
            None => return Err(CommandError::Usage("<file>")),
        },
        "vol" => match rest {
            [target, volume, ..] => Command::Volume {
                target: VolumeTarget::parse(target),
                volume: parse_volume(volume)?,
            },
            _ => return Err(CommandError::Usage("<user|all> <volume>")),
        },
        _ => return Err(CommandError::Unknown(name.clone())),
    };
    Ok(Some(command))
}

fn parse_volume(arg: &str) -> Result<u32, CommandError> {
    let volume: i64 = arg
        .parse()
        .map_err(|_| CommandError::InvalidVolume(arg.to_owned()))?;
    if volume < 0 {
        return Err(CommandError::VolumeTooLow);
    }
    if volume > 100 {
        return Err(CommandError::VolumeTooHigh);
    }
    u32::try_from(volume).map_err(|_| CommandError::VolumeTooHigh)
}

/// Run `command` against `server`, reporting the outcome to `out`. Returns
/// `false` when the console should stop.
pub fn execute(server: &Server, command: Command, out: &mut impl Write) -> io::Result<bool> {
    match command {
        Command::Help => writeln!(out, "{HELP}")?,
        Command::List => {
            let mut users = server.connected_users();
            users.sort();
            if users.is_empty() {
                writeln!(out, "No users connected")?;
            }
            for user in users {
                writeln!(out, "{user}")?;
            }
        }
        Command::Play(path) => match server.play_music(&path) {
            Ok(()) => writeln!(out, "Started music playback")?,
            Err(e) => writeln!(out, "Error starting music playback: {e}")?,
        },
        Command::Stop => match server.stop_music() {
            Ok(()) => writeln!(out, "Stopped music playback")?,
            Err(e) => writeln!(out, "Error stopping music playback: {e}")?,
        },
        Command::Volume { target, volume } => match server.set_volume(&target, volume) {
            Ok(()) => writeln!(out, "Set volume of user '{target}' to '{volume}'")?,
            Err(e) => writeln!(out, "Error setting volume: {e}")?,
        },
        Command::Exit => return Ok(false),
    }
    Ok(true)
}

/// Read commands from `input` until `exit` or end of input.
pub fn run_console(server: &Server, input: impl BufRead, mut out: impl Write) -> io::Result<()> {
    write!(out, "{PROMPT}")?;
    out.flush()?;
    for line in input.lines() {
        let line = line?;
        match parse_line(&line) {
            Ok(Some(command)) => {
                if !execute(server, command, &mut out)? {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => writeln!(out, "{e}")?,
        }
        write!(out, "{PROMPT}")?;
        out.flush()?;
    }
    Ok(())
}
