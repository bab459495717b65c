use crate::security::{Result, SecurityError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Longest prefix of a value that is run through the patterns
pub const MAX_SCAN_BYTES: usize = 64 * 1024;

/// Characters of an offending value kept in log entries
pub const EXCERPT_CHARS: usize = 100;

const SQL_INJECTION_PATTERNS: &[&str] = &[
    r"(?is)\bunion\b.*\bselect\b",
    r"(?is)\bselect\b.*\bfrom\b",
    r"(?is)\binsert\b.*\binto\b",
    r"(?is)\bupdate\b.*\bset\b",
    r"(?is)\bdelete\b.*\bfrom\b",
    r"(?is)\bdrop\b.*\btable\b",
    r"(?i)\bexec\b|\bexecute\b",
    r"(?is)\bscript\b.*>",
    r#"['";#*|]|--"#,
];

const XSS_PATTERNS: &[&str] = &[
    r"(?is)<script\b[^>]*>.*?</script\s*>",
    r"(?is)<iframe\b[^>]*>.*?</iframe\s*>",
    r"(?i)javascript:",
    r"(?i)\bon\w+\s*=",
    r"(?is)<object\b[^>]*>.*?</object\s*>",
    r"(?i)<embed\b[^>]*>",
    r"(?is)<applet\b[^>]*>.*?</applet\s*>",
];

const SUSPICIOUS_USER_AGENTS: &[&str] = &[
    "sqlmap",
    "nikto",
    "nessus",
    "openvas",
    "nmap",
    "masscan",
    "zap",
    "burp",
    "wget",
    "curl",
    "python-requests",
    "bot",
    "crawler",
    "spider",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatKind {
    SqlInjection,
    Xss,
}

impl ThreatKind {
    /// Security event name logged when this kind of threat is seen
    pub fn event_name(&self) -> &'static str {
        match self {
            ThreatKind::SqlInjection => "sql_injection_attempt",
            ThreatKind::Xss => "xss_attempt",
        }
    }
}

impl fmt::Display for ThreatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreatKind::SqlInjection => write!(f, "SQL injection"),
            ThreatKind::Xss => write!(f, "XSS"),
        }
    }
}

/// Coarse pattern pre-filter for request values.
///
/// False positives (an apostrophe in a surname, a `#` in a password) are accepted;
/// this is not a substitute for parameterised queries or output escaping.
pub struct ThreatDetector {
    sql_injection_patterns: Vec<Regex>,
    xss_patterns: Vec<Regex>,
}

impl ThreatDetector {
    pub fn new() -> Result<Self> {
        let sql_injection_patterns = compile(SQL_INJECTION_PATTERNS, "SQL injection")?;
        let xss_patterns = compile(XSS_PATTERNS, "XSS")?;

        debug!(
            "Initialized threat patterns: {} SQL, {} XSS",
            sql_injection_patterns.len(),
            xss_patterns.len()
        );

        Ok(Self {
            sql_injection_patterns,
            xss_patterns,
        })
    }

    pub fn looks_like_sql_injection(&self, text: &str) -> bool {
        let text = scan_window(text);
        self.sql_injection_patterns.iter().any(|p| p.is_match(text))
    }

    pub fn looks_like_xss(&self, text: &str) -> bool {
        let text = scan_window(text);
        self.xss_patterns.iter().any(|p| p.is_match(text))
    }

    pub fn matches(&self, kind: ThreatKind, text: &str) -> bool {
        match kind {
            ThreatKind::SqlInjection => self.looks_like_sql_injection(text),
            ThreatKind::Xss => self.looks_like_xss(text),
        }
    }

    /// First `(name, value)` pair that trips `kind`
    pub fn find<'a, I>(&self, kind: ThreatKind, fields: I) -> Option<(&'a str, &'a str)>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        fields
            .into_iter()
            .find(|(_, value)| self.matches(kind, value))
    }
}

fn compile(patterns: &[&str], label: &str) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|e| SecurityError::Configuration {
                message: format!("Failed to compile {label} pattern: {e}"),
            })
        })
        .collect()
}

/// Cap the scanned text at [`MAX_SCAN_BYTES`] without splitting a character
fn scan_window(text: &str) -> &str {
    if text.len() <= MAX_SCAN_BYTES {
        return text;
    }
    let mut end = MAX_SCAN_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Value as written to log entries
pub fn excerpt(value: &str) -> String {
    value.chars().take(EXCERPT_CHARS).collect()
}

/// Scanner signature contained in `user_agent`, if any
pub fn suspicious_user_agent(user_agent: &str) -> Option<&'static str> {
    let lowered = user_agent.to_lowercase();
    SUSPICIOUS_USER_AGENTS
        .iter()
        .copied()
        .find(|needle| lowered.contains(needle))
}
