//! Deterministic artifact names.

use chrono::{DateTime, Utc};

const FALLBACK_TITLE: &str = "document";

/// Reduce a title to `[A-Za-z0-9._-]`, collapsing every other run into `-`.
///
/// A trailing `.pdf` is dropped first, and an empty result becomes
/// `document`.
pub fn sanitize_title(title: &str) -> String {
    let trimmed = title.trim();
    let split = trimmed.len().saturating_sub(4);
    let base = match (trimmed.get(..split), trimmed.get(split..)) {
        (Some(head), Some(ext)) if !head.is_empty() && ext.eq_ignore_ascii_case(".pdf") => head,
        _ => trimmed,
    };

    let mut out = String::with_capacity(base.len());
    let mut in_run = false;
    for c in base.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }

    let cleaned = out.trim_matches('-');
    if cleaned.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        cleaned.to_string()
    }
}

/// `<sanitized-title>-<YYYYMMDDHHMMSS>` in UTC.
pub fn artifact_stem(title: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "{}-{}",
        sanitize_title(title),
        timestamp.format("%Y%m%d%H%M%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn punctuation_runs_collapse() {
        assert_eq!(sanitize_title("Report: Q1/Q2"), "Report-Q1-Q2");
        assert_eq!(sanitize_title("a  &&  b"), "a-b");
    }

    #[test]
    fn leading_and_trailing_dashes_trimmed() {
        assert_eq!(sanitize_title("  (draft) "), "draft");
        assert_eq!(sanitize_title("--x--"), "x");
    }

    #[test]
    fn empty_titles_fall_back() {
        assert_eq!(sanitize_title(""), "document");
        assert_eq!(sanitize_title("???"), "document");
        assert_eq!(sanitize_title("日本語"), "document");
    }

    #[test]
    fn pdf_extension_is_dropped() {
        assert_eq!(sanitize_title("Invoice 42.PDF"), "Invoice-42");
        assert_eq!(sanitize_title("notes.v2.pdf"), "notes.v2");
        assert_eq!(sanitize_title(".pdf"), ".pdf");
    }

    #[test]
    fn stem_uses_utc_timestamp() {
        let ts = Utc.with_ymd_and_hms(2024, 9, 18, 10, 30, 0).unwrap();
        assert_eq!(
            artifact_stem("Report: Q1/Q2", ts),
            "Report-Q1-Q2-20240918103000"
        );
    }

    #[test]
    fn same_inputs_same_stem() {
        let ts = Utc.with_ymd_and_hms(2023, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(artifact_stem("x y", ts), artifact_stem("x y", ts));
    }
}
