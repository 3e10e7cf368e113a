//! Classification of raw probe output lines.
//!
//! Phrasing differs between operating systems, so both the latency marker and
//! the failure phrases are configurable.

use regex::{Regex, RegexSet};
use thiserror::Error;

use super::Measurement;

/// Markers that precede a round-trip time on Windows, Linux and macOS.
pub const DEFAULT_TIME_MARKERS: &[&str] = &["time=", "time<"];

/// Timeout / unreachable phrasing seen across platforms (matched case-insensitively).
pub const DEFAULT_FAILURE_PATTERNS: &[&str] = &[
    r"request timed out",
    r"request timeout for icmp_seq",
    r"no answer yet for icmp_seq",
    r"destination (host|net|port|protocol) unreachable",
    r"general failure",
    r"ttl expired in transit",
    r"time to live exceeded",
    r"transmit failed",
];

#[derive(Error, Debug)]
pub enum ParserError {
    #[error("at least one time marker is required")]
    NoMarkers,
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Classification of one line of probe output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    /// Latency evidence with a readable round-trip time.
    Success(u64),
    /// Known timeout or unreachable phrasing.
    Failure,
    /// A latency marker without digits next to it. Logged, not counted.
    MissingRtt,
    /// Banners, blank lines, summaries. Logged, not counted.
    Unmatched,
}

impl LineClass {
    pub fn is_classified(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Failure)
    }
}

/// Extracts success/failure and round-trip time from probe output.
#[derive(Debug, Clone)]
pub struct ResultParser {
    latency: Regex,
    failures: RegexSet,
}

impl Default for ResultParser {
    fn default() -> Self {
        Self::new(DEFAULT_TIME_MARKERS, DEFAULT_FAILURE_PATTERNS)
            .expect("built-in parser patterns are valid")
    }
}

impl ResultParser {
    /// Build a parser from literal time markers (e.g. `time=`) and failure
    /// patterns (regular expressions, case-insensitive).
    pub fn new<M, P>(markers: &[M], failure_patterns: &[P]) -> Result<Self, ParserError>
    where
        M: AsRef<str>,
        P: AsRef<str>,
    {
        if markers.is_empty() {
            return Err(ParserError::NoMarkers);
        }

        let alternatives: Vec<String> = markers
            .iter()
            .map(|m| regex::escape(m.as_ref()))
            .collect();
        let latency = Regex::new(&format!(
            r"(?i)(?:{})\s*(?P<rtt>\d+)?",
            alternatives.join("|")
        ))?;

        let failures = RegexSet::new(
            failure_patterns
                .iter()
                .map(|p| format!("(?i){}", p.as_ref())),
        )?;

        Ok(Self { latency, failures })
    }

    /// Classify a single line.
    pub fn classify(&self, line: &str) -> LineClass {
        if let Some(caps) = self.latency.captures(line) {
            return match caps.name("rtt").map(|m| m.as_str().parse::<u64>()) {
                Some(Ok(rtt)) => LineClass::Success(rtt),
                _ => LineClass::MissingRtt,
            };
        }

        if self.failures.is_match(line) {
            return LineClass::Failure;
        }

        LineClass::Unmatched
    }

    /// Parse a line into a measurement, or `None` when the line carries no
    /// usable outcome.
    pub fn parse(&self, line: &str) -> Option<Measurement> {
        match self.classify(line) {
            LineClass::Success(rtt) => Some(Measurement::success(rtt)),
            LineClass::Failure => Some(Measurement::failure()),
            LineClass::MissingRtt | LineClass::Unmatched => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_windows_reply() {
        let parser = ResultParser::default();
        let m = parser
            .parse("Reply from 8.8.8.8: bytes=32 time=23ms TTL=64")
            .unwrap();
        assert!(m.success);
        assert_eq!(m.rtt_millis, Some(23));
    }

    #[test]
    fn test_parse_windows_sub_millisecond() {
        let parser = ResultParser::default();
        assert_eq!(
            parser.classify("Reply from 10.0.0.1: bytes=32 time<1ms TTL=128"),
            LineClass::Success(1)
        );
    }

    #[test]
    fn test_parse_linux_reply_truncates_fraction() {
        let parser = ResultParser::default();
        let m = parser
            .parse("64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms")
            .unwrap();
        assert_eq!(m.rtt_millis, Some(12));
    }

    #[test]
    fn test_parse_timeout() {
        let parser = ResultParser::default();
        let m = parser.parse("Request timed out.").unwrap();
        assert!(!m.success);
        assert_eq!(m.rtt_millis, None);
    }

    #[test]
    fn test_parse_unreachable_variants() {
        let parser = ResultParser::default();
        for line in [
            "Reply from 192.168.1.5: Destination host unreachable.",
            "From 10.0.0.1 icmp_seq=3 Destination Host Unreachable",
            "Request timeout for icmp_seq 4",
            "no answer yet for icmp_seq=2",
        ] {
            assert_eq!(parser.classify(line), LineClass::Failure, "{}", line);
        }
    }

    #[test]
    fn test_parse_unclassified_lines() {
        let parser = ResultParser::default();
        assert!(parser.parse("").is_none());
        assert!(parser
            .parse("PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.")
            .is_none());
        // Linux summary says "time 3003ms" without a marker
        assert_eq!(
            parser.classify("4 packets transmitted, 4 received, 0% packet loss, time 3003ms"),
            LineClass::Unmatched
        );
        assert_eq!(
            parser.classify("rtt min/avg/max/mdev = 12.300/12.300/12.300/0.000 ms"),
            LineClass::Unmatched
        );
    }

    #[test]
    fn test_marker_without_digits_is_dropped() {
        let parser = ResultParser::default();
        assert_eq!(parser.classify("Reply from x: time=abc"), LineClass::MissingRtt);
        assert!(parser.parse("Reply from x: time=abc").is_none());
    }

    #[test]
    fn test_custom_locale() {
        let parser = ResultParser::new(&["Zeit="], &["Zeitüberschreitung der Anforderung"]).unwrap();
        assert_eq!(
            parser.classify("Antwort von 8.8.8.8: Bytes=32 Zeit=17ms TTL=117"),
            LineClass::Success(17)
        );
        assert_eq!(
            parser.classify("Zeitüberschreitung der Anforderung."),
            LineClass::Failure
        );
        // English phrasing is not known to this parser
        assert_eq!(parser.classify("Request timed out."), LineClass::Unmatched);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(matches!(
            ResultParser::new(&["time="], &["("]),
            Err(ParserError::Pattern(_))
        ));
        let none: &[&str] = &[];
        assert!(matches!(
            ResultParser::new(none, &["x"]),
            Err(ParserError::NoMarkers)
        ));
    }
}
