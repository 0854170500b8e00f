//! Child-process output forwarding

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineLevel {
    Error,
    Warn,
    Other,
}

/// Check for log level indicators at word boundaries
/// to avoid false positives like "The error handler"
pub(crate) fn classify(line: &str) -> LineLevel {
    let is_error = line.contains(" ERROR ")
        || line.starts_with("ERROR ")
        || line.starts_with("error:")
        || line.starts_with("error[")
        || line.contains("[ERROR]");
    let is_warn = line.contains(" WARN ")
        || line.starts_with("WARN ")
        || line.starts_with("warning:")
        || line.contains("[WARN]");

    if is_error {
        LineLevel::Error
    } else if is_warn {
        LineLevel::Warn
    } else {
        LineLevel::Other
    }
}

/// Log every line of `reader` under `source` until EOF.
///
/// Unmarked lines go to `debug`, or to `info` when `loud` is set.
/// Returns the number of lines forwarded.
pub(crate) async fn forward_lines<R>(reader: R, source: String, stream: &'static str, loud: bool) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut count = 0;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                count += 1;
                match classify(&line) {
                    LineLevel::Error => error!(target: "goplug::child", plugin = %source, stream, "{}", line),
                    LineLevel::Warn => warn!(target: "goplug::child", plugin = %source, stream, "{}", line),
                    LineLevel::Other if loud => info!(target: "goplug::child", plugin = %source, stream, "{}", line),
                    LineLevel::Other => debug!(target: "goplug::child", plugin = %source, stream, "{}", line),
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(plugin = %source, stream, error = %e, "Error reading child output");
                break;
            }
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_word_boundaries() {
        assert_eq!(classify("2024 ERROR something broke"), LineLevel::Error);
        assert_eq!(classify("error[E0425]: cannot find value"), LineLevel::Error);
        assert_eq!(classify("warning: unused variable"), LineLevel::Warn);
        assert_eq!(classify("The error handler ran"), LineLevel::Other);
    }

    #[tokio::test]
    async fn test_forward_counts_lines() {
        let input: &[u8] = b"one\ntwo\nthree";
        let count = forward_lines(input, "test".into(), "stdout", false).await;
        assert_eq!(count, 3);
    }
}
