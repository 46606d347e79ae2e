//! Chat responses recovered from program logs
//!
//! The model program does not return its answer; it prints it. Two shapes
//! are recognised, both after the ledger's `Program log: ` prefix:
//!
//! ```text
//! Program log: LLM RESPONSE: Hello%2C%20world
//!
//! Program log: ==== LLM RESPONSE ====
//! Program log: Hello, world
//! ```
//!
//! The first carries percent-encoded text after the marker; the second
//! prints a banner and the raw text on the following line.

use percent_encoding::percent_decode_str;

const PROGRAM_LOG_PREFIX: &str = "Program log: ";
const RESPONSE_BANNER: &str = "==== LLM RESPONSE ====";

/// Parses response text out of a transaction's log lines
#[derive(Debug, Clone)]
pub struct ResponseExtractor {
    marker: String,
}

impl ResponseExtractor {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    /// First response found in `logs`, if any
    pub fn extract<S: AsRef<str>>(&self, logs: &[S]) -> Option<String> {
        let mut lines = logs.iter().map(|line| strip_program_log(line.as_ref()));
        while let Some(line) = lines.next() {
            if line.trim() == RESPONSE_BANNER {
                if let Some(text) = lines.next() {
                    return Some(text.to_string());
                }
                continue;
            }
            if let Some(encoded) = line.strip_prefix(self.marker.as_str()) {
                let decoded = percent_decode_str(encoded.trim_start()).decode_utf8_lossy();
                return Some(decoded.into_owned());
            }
        }
        None
    }
}

impl Default for ResponseExtractor {
    fn default() -> Self {
        Self::new("LLM RESPONSE:")
    }
}

fn strip_program_log(line: &str) -> &str {
    line.strip_prefix(PROGRAM_LOG_PREFIX).unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_encoded_marker_line() {
        let logs = [
            "Program CG3rq4URcAwEUNnfGZ3YHRKTZAZgyemttN1BQwypa8qj invoke [1]",
            "Program log: Instruction: Chat",
            "Program log: LLM RESPONSE: Hello%2C%20LLM%21%20%F0%9F%91%8B",
            "Program CG3rq4URcAwEUNnfGZ3YHRKTZAZgyemttN1BQwypa8qj success",
        ];
        assert_eq!(
            ResponseExtractor::default().extract(&logs),
            Some("Hello, LLM! \u{1f44b}".to_string())
        );
    }

    #[test]
    fn test_banner_followed_by_raw_text() {
        let logs = vec![
            "Program log: Instruction: Chat".to_string(),
            "Program log: ==== LLM RESPONSE ====".to_string(),
            "Program log: hi there".to_string(),
        ];
        assert_eq!(
            ResponseExtractor::default().extract(&logs),
            Some("hi there".to_string())
        );
    }

    #[test]
    fn test_no_marker_means_no_response() {
        let logs = ["Program log: Instruction: Chat", "Program consumed 1200 compute units"];
        assert_eq!(ResponseExtractor::default().extract(&logs), None);

        let banner_only = ["Program log: ==== LLM RESPONSE ===="];
        assert_eq!(ResponseExtractor::default().extract(&banner_only), None);
    }

    #[test]
    fn test_custom_marker_and_bad_encoding() {
        let extractor = ResponseExtractor::new("ANSWER:");
        let logs = ["Program log: LLM RESPONSE: ignored", "ANSWER:%FFok"];
        assert_eq!(extractor.extract(&logs), Some("\u{fffd}ok".to_string()));
    }
}
