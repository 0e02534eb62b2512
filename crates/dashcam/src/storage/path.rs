//! Output path templates
//!
//! A template without placeholders is a fixed path that every session
//! overwrites. Placeholders give each session its own file:
//!
//! - `{seq}`: frame number, zero-padded to four digits
//! - `{timestamp}`: Unix time in seconds
//! - `{datetime}`: local time as `MMDDhhmmss`

use chrono::{DateTime, Local};
use std::fmt;
use std::path::PathBuf;

const SEQ: &str = "{seq}";
const TIMESTAMP: &str = "{timestamp}";
const DATETIME: &str = "{datetime}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPath {
    template: String,
}

impl Default for OutputPath {
    fn default() -> Self {
        Self::new("/var/www/html/left.jpg")
    }
}

impl OutputPath {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// True if every session writes to the same file
    pub fn is_fixed(&self) -> bool {
        ![SEQ, TIMESTAMP, DATETIME]
            .iter()
            .any(|p| self.template.contains(p))
    }

    /// Path for the session numbered `sequence`, started at `at`.
    pub fn resolve(&self, sequence: u64, at: DateTime<Local>) -> PathBuf {
        let mut path = self.template.clone();
        if path.contains(SEQ) {
            path = path.replace(SEQ, &format!("{sequence:04}"));
        }
        if path.contains(TIMESTAMP) {
            path = path.replace(TIMESTAMP, &at.timestamp().to_string());
        }
        if path.contains(DATETIME) {
            path = path.replace(DATETIME, &at.format("%m%d%H%M%S").to_string());
        }
        PathBuf::from(path)
    }
}

impl From<&str> for OutputPath {
    fn from(template: &str) -> Self {
        Self::new(template)
    }
}

impl fmt::Display for OutputPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    #[test]
    fn fixed_path_ignores_sequence() {
        let path = OutputPath::new("/var/www/html/left.jpg");
        assert!(path.is_fixed());
        assert_eq!(path.resolve(1, at()), path.resolve(2, at()));
    }

    #[test]
    fn sequence_is_zero_padded() {
        let path = OutputPath::new("/data/still-{seq}.jpg");
        assert!(!path.is_fixed());
        assert_eq!(path.resolve(7, at()), PathBuf::from("/data/still-0007.jpg"));
        assert_eq!(
            path.resolve(12345, at()),
            PathBuf::from("/data/still-12345.jpg")
        );
    }

    #[test]
    fn datetime_and_timestamp() {
        let path = OutputPath::new("/data/{datetime}.jpg");
        assert_eq!(path.resolve(0, at()), PathBuf::from("/data/0309140507.jpg"));

        let path = OutputPath::new("/data/{timestamp}.jpg");
        let expected = format!("/data/{}.jpg", at().timestamp());
        assert_eq!(path.resolve(0, at()), PathBuf::from(expected));
    }
}
