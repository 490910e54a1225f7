use super::IngestError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyMode {
    /// `200` with an empty body.
    Silent,
    /// `.ok` suffix: `200` with body `OK`.
    Ok,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngestTarget {
    pub topic: String,
    pub hash: String,
    pub reply: ReplyMode,
}

/// Topic and tenant names end up as space-separated `CHAN` tokens, so they
/// are limited to `[A-Za-z0-9._-]`.
pub fn is_valid_name(value: &str) -> bool {
    !value.is_empty()
        && value
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-'))
}

/// Parses `/<prefix>/<topic>/<hash>` or `/<prefix>/<topic>/<hash>.ok`.
pub fn parse_target(prefix: &str, path: &str) -> Result<IngestTarget, IngestError> {
    let malformed = || IngestError::MalformedPath {
        path: path.to_owned(),
    };

    let mut segments = path.strip_prefix('/').unwrap_or(path).split('/');
    if segments.next() != Some(prefix) {
        return Err(IngestError::NotFound);
    }
    let (Some(topic), Some(last), None) = (segments.next(), segments.next(), segments.next())
    else {
        return Err(malformed());
    };

    if !is_valid_name(topic) {
        return Err(IngestError::InvalidTopic {
            topic: topic.to_owned(),
        });
    }

    let (hash, reply) = match last.split_once('.') {
        None => (last, ReplyMode::Silent),
        Some((hash, suffix)) if suffix.eq_ignore_ascii_case("ok") => (hash, ReplyMode::Ok),
        Some((_, suffix)) => {
            return Err(IngestError::UnsupportedSuffix {
                suffix: suffix.to_owned(),
            });
        }
    };
    if hash.is_empty() {
        return Err(malformed());
    }

    Ok(IngestTarget {
        topic: topic.to_owned(),
        hash: hash.to_owned(),
        reply,
    })
}
