mod lab1;

use grader_core::{ColorMode, TestSuite};
use regex::Regex;

/// Test suite for lab `number`, if one exists.
pub fn suite(number: u32, color: ColorMode) -> Option<TestSuite> {
    match number {
        1 => Some(lab1::suite(color)),
        _ => None,
    }
}

/// Extracts `N` from a name starting with `labN`, such as a branch name.
pub fn parse_lab(name: &str) -> Option<u32> {
    let pattern = Regex::new(r"^lab(\d+)").ok()?;
    pattern.captures(name.trim())?.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lab_prefixes() {
        assert_eq!(parse_lab("lab1"), Some(1));
        assert_eq!(parse_lab("lab12-timer"), Some(12));
        assert_eq!(parse_lab("lab3\n"), Some(3));
        assert_eq!(parse_lab("main"), None);
        assert_eq!(parse_lab("feature/lab2"), None);
        assert_eq!(parse_lab("lab"), None);
    }

    #[test]
    fn only_known_labs_have_suites() {
        assert!(suite(1, ColorMode::Never).is_some());
        assert!(suite(2, ColorMode::Never).is_none());
    }
}
