use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("invalid duration {input:?}: {reason}")]
pub struct ParseDurationError {
    input: String,
    reason: String,
}

/// Parses a Go style duration string such as `"30s"`, `"1m30s"` or `"250ms"`.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// let grace = spot_handler_ext::parse_duration("1m30s").unwrap();
/// assert_eq!(grace, Duration::from_secs(90));
/// ```
pub fn parse_duration(input: &str) -> Result<Duration, ParseDurationError> {
    let error = |reason: String| ParseDurationError {
        input: input.to_string(),
        reason,
    };
    let nanos = go_parse_duration::parse_duration(input).map_err(|err| error(format!("{err:?}")))?;
    let nanos = u64::try_from(nanos).map_err(|_| error("negative durations are not allowed".to_string()))?;
    Ok(Duration::from_nanos(nanos))
}
