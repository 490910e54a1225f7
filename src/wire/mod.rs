//! Line-oriented worker protocol.
//!
//! ```text
//! server: HELLO hfast.v1
//! worker: CHAN <topic> [<topic> ...]
//! server: READY
//! worker: READY
//! server: JOB <id> <len>        followed by exactly <len> payload bytes
//! worker: PONG                  optional, extends the deadline
//! worker: OK                    completes the job
//! server: INVALID               protocol violation, connection closed
//! ```

pub mod command;
pub mod session;

pub const PROTOCOL_VERSION: &str = "hfast.v1";
pub const BANNER_LINE: &[u8] = b"HELLO hfast.v1\r\n";
pub const READY_LINE: &[u8] = b"READY\r\n";
pub const INVALID_LINE: &[u8] = b"INVALID\r\n";
/// Longest accepted command line, terminator included.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

pub fn job_header(id: u64, len: usize) -> String {
    format!("JOB {id} {len}\r\n")
}

#[cfg(test)]
mod tests {
    use super::{BANNER_LINE, PROTOCOL_VERSION, job_header};

    #[test]
    fn banner_names_protocol_version() {
        let banner = std::str::from_utf8(BANNER_LINE).expect("banner should be ASCII");
        assert_eq!(banner, format!("HELLO {PROTOCOL_VERSION}\r\n"));
    }

    #[test]
    fn job_header_carries_id_and_length() {
        assert_eq!(job_header(1, 42), "JOB 1 42\r\n");
    }
}
