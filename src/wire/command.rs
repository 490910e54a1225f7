use std::fmt;
use std::io::{self, BufRead, Read};

use super::MAX_LINE_BYTES;

/// A command sent by a worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerCommand {
    Chan(Vec<String>),
    Ready,
    Pong,
    Ok,
}

impl WorkerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Chan(_) => "CHAN",
            Self::Ready => "READY",
            Self::Pong => "PONG",
            Self::Ok => "OK",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum CommandError {
    Empty,
    Unknown { verb: String },
    MissingTopics,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty command line"),
            Self::Unknown { verb } => write!(f, "unknown command '{verb}'"),
            Self::MissingTopics => write!(f, "CHAN requires at least one topic"),
        }
    }
}

impl std::error::Error for CommandError {}

/// Parses one command line; surrounding whitespace, a CRLF terminator
/// included, is ignored.
///
/// Only the first token selects the command; trailing arguments of
/// `READY`, `PONG` and `OK` are ignored.
pub fn parse_command(line: &str) -> Result<WorkerCommand, CommandError> {
    let mut tokens = line.split_whitespace();
    let verb = tokens.next().ok_or(CommandError::Empty)?;

    match verb {
        "CHAN" => {
            let topics: Vec<String> = tokens.map(str::to_owned).collect();
            if topics.is_empty() {
                return Err(CommandError::MissingTopics);
            }
            Ok(WorkerCommand::Chan(topics))
        }
        "READY" => Ok(WorkerCommand::Ready),
        "PONG" => Ok(WorkerCommand::Pong),
        "OK" => Ok(WorkerCommand::Ok),
        other => Err(CommandError::Unknown {
            verb: other.to_owned(),
        }),
    }
}

/// Reads one `\n`-terminated line. Returns `None` on a clean end of stream.
///
/// Lines longer than [`MAX_LINE_BYTES`] and non-UTF-8 lines fail with
/// `InvalidData`; a stream ending mid-line fails with `UnexpectedEof`.
pub fn read_command_line(reader: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut buffer = Vec::new();
    let read = reader
        .by_ref()
        .take(MAX_LINE_BYTES as u64)
        .read_until(b'\n', &mut buffer)?;

    if read == 0 {
        return Ok(None);
    }
    if buffer.last() != Some(&b'\n') {
        if buffer.len() >= MAX_LINE_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("command line exceeds {MAX_LINE_BYTES} bytes"),
            ));
        }
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-line",
        ));
    }

    String::from_utf8(buffer)
        .map(|line| Some(line.trim_end_matches(['\r', '\n']).to_owned()))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "command line is not UTF-8"))
}

#[cfg(test)]
mod tests {
    use std::io::{BufReader, Cursor, ErrorKind};

    use super::{CommandError, WorkerCommand, parse_command, read_command_line};
    use crate::wire::MAX_LINE_BYTES;

    #[test]
    fn parses_chan_with_multiple_topics() {
        assert_eq!(
            parse_command("CHAN acme.example_alerts acme.example_billing"),
            Ok(WorkerCommand::Chan(vec![
                "acme.example_alerts".to_owned(),
                "acme.example_billing".to_owned()
            ]))
        );
    }

    #[test]
    fn chan_without_topics_is_rejected() {
        assert_eq!(parse_command("CHAN"), Err(CommandError::MissingTopics));
        assert_eq!(parse_command("CHAN   "), Err(CommandError::MissingTopics));
    }

    #[test]
    fn parses_bare_verbs_and_ignores_trailing_arguments() {
        assert_eq!(parse_command("READY"), Ok(WorkerCommand::Ready));
        assert_eq!(parse_command(" PONG 17 "), Ok(WorkerCommand::Pong));
        assert_eq!(parse_command("OK 17"), Ok(WorkerCommand::Ok));
    }

    #[test]
    fn verbs_are_case_sensitive() {
        assert_eq!(
            parse_command("ready"),
            Err(CommandError::Unknown {
                verb: "ready".to_owned()
            })
        );
        assert_eq!(parse_command(""), Err(CommandError::Empty));
    }

    #[test]
    fn reads_crlf_and_lf_terminated_lines() {
        let mut reader = BufReader::new(Cursor::new(b"CHAN a_b\r\nREADY\n".to_vec()));
        assert_eq!(
            read_command_line(&mut reader).expect("line should read"),
            Some("CHAN a_b".to_owned())
        );
        assert_eq!(
            read_command_line(&mut reader).expect("line should read"),
            Some("READY".to_owned())
        );
        assert_eq!(read_command_line(&mut reader).expect("eof should read"), None);
    }

    #[test]
    fn rejects_unterminated_and_oversized_lines() {
        let mut partial = BufReader::new(Cursor::new(b"REA".to_vec()));
        let err = read_command_line(&mut partial).expect_err("partial line should fail");
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);

        let mut oversized = BufReader::new(Cursor::new(vec![b'A'; MAX_LINE_BYTES + 10]));
        let err = read_command_line(&mut oversized).expect_err("oversized line should fail");
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
