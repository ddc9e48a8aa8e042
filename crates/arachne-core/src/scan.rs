//! Best-effort static scan of package contents.
//!
//! Both functions are pure: the registry feeds them bytes it has already
//! read and acts on the classification. This is pattern matching, not a
//! sandbox.

use serde::{Deserialize, Serialize};

use crate::plugin::SafetyClassification;

/// Patterns the scan looks for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRules {
    /// Any match classifies the package as dangerous.
    pub dangerous: Vec<String>,
    /// Matches classify the package as warning unless something dangerous
    /// was found too.
    pub warning: Vec<String>,
    /// Only this many leading bytes are scanned.
    pub max_scan_bytes: usize,
    /// Below this fraction of printable text the content is not analysable.
    pub min_text_ratio: f32,
}

impl Default for ScanRules {
    fn default() -> Self {
        let dangerous = [
            "Runtime.getRuntime",
            "ProcessBuilder",
            "System.exit",
            "child_process",
            "require('fs')",
            "require(\"fs\")",
            "os.system",
            "subprocess",
            "rm -rf",
            "su -c",
        ];
        let warning = [
            "eval(",
            "new Function(",
            "DexClassLoader",
            "java.lang.reflect",
            "loadLibrary",
            "atob(",
            "fromCharCode",
        ];
        Self {
            dangerous: dangerous.iter().map(|s| s.to_string()).collect(),
            warning: warning.iter().map(|s| s.to_string()).collect(),
            max_scan_bytes: 4 * 1024 * 1024,
            min_text_ratio: 0.85,
        }
    }
}

/// What the scan found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub scanned_bytes: usize,
    pub text_ratio: f32,
    pub analysable: bool,
    pub dangerous: Vec<String>,
    pub warnings: Vec<String>,
}

pub fn scan(bytes: &[u8], rules: &ScanRules) -> ScanReport {
    let window = &bytes[..bytes.len().min(rules.max_scan_bytes)];
    let text_ratio = text_ratio(window);
    let analysable = !window.is_empty() && text_ratio >= rules.min_text_ratio;

    let mut report = ScanReport {
        scanned_bytes: window.len(),
        text_ratio,
        analysable,
        ..ScanReport::default()
    };
    if !analysable {
        return report;
    }

    let text = String::from_utf8_lossy(window);
    report.dangerous = matches(&text, &rules.dangerous);
    report.warnings = matches(&text, &rules.warning);
    report
}

pub fn classify(report: &ScanReport) -> SafetyClassification {
    if !report.analysable {
        SafetyClassification::Unknown
    } else if !report.dangerous.is_empty() {
        SafetyClassification::Dangerous
    } else if !report.warnings.is_empty() {
        SafetyClassification::Warning
    } else {
        SafetyClassification::Safe
    }
}

fn matches(text: &str, patterns: &[String]) -> Vec<String> {
    patterns
        .iter()
        .filter(|p| !p.is_empty() && text.contains(p.as_str()))
        .cloned()
        .collect()
}

/// Fraction of bytes that look like text (printable ASCII, whitespace, or
/// part of a UTF-8 multibyte sequence).
fn text_ratio(bytes: &[u8]) -> f32 {
    if bytes.is_empty() {
        return 0.0;
    }
    let printable = bytes
        .iter()
        .filter(|&&b| matches!(b, b'\t' | b'\n' | b'\r' | 0x20..=0x7e) || b >= 0x80)
        .count();
    printable as f32 / bytes.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_package_is_safe() {
        let report = scan(br#"{"key":"demo","site":"https://example.com"}"#, &ScanRules::default());
        assert!(report.analysable);
        assert_eq!(classify(&report), SafetyClassification::Safe);
    }

    #[test]
    fn test_dangerous_pattern_wins_over_warning() {
        let body = b"var x = eval(y); Runtime.getRuntime().exec('ls');";
        let report = scan(body, &ScanRules::default());
        assert_eq!(report.dangerous, vec!["Runtime.getRuntime".to_string()]);
        assert_eq!(report.warnings, vec!["eval(".to_string()]);
        assert_eq!(classify(&report), SafetyClassification::Dangerous);
    }

    #[test]
    fn test_warning_only() {
        let report = scan(b"let s = String.fromCharCode(65);", &ScanRules::default());
        assert_eq!(classify(&report), SafetyClassification::Warning);
    }

    #[test]
    fn test_binary_content_is_unknown() {
        let bytes: Vec<u8> = (0u8..32).cycle().take(1024).collect();
        let report = scan(&bytes, &ScanRules::default());
        assert!(!report.analysable);
        assert!(report.dangerous.is_empty());
        assert_eq!(classify(&report), SafetyClassification::Unknown);
    }

    #[test]
    fn test_empty_content_is_unknown() {
        assert_eq!(
            classify(&scan(b"", &ScanRules::default())),
            SafetyClassification::Unknown
        );
    }

    #[test]
    fn test_scan_window_is_bounded() {
        let rules = ScanRules {
            max_scan_bytes: 8,
            ..ScanRules::default()
        };
        let report = scan(b"harmless System.exit(1)", &rules);
        assert_eq!(report.scanned_bytes, 8);
        assert_eq!(classify(&report), SafetyClassification::Safe);
    }
}
