use rasid_core::SourcePattern;
use rasid_extract::InstitutionHint;
use regex::{Regex, RegexBuilder};
use serde::Serialize;

/// Outcome of scanning one text against the institution rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchResult {
    pub institution: Option<String>,
    pub matched: bool,
}

impl MatchResult {
    pub fn unmatched() -> Self {
        Self { institution: None, matched: false }
    }

    pub fn label(&self) -> &str {
        self.institution.as_deref().unwrap_or("unknown")
    }

    pub fn hint(&self) -> InstitutionHint {
        match &self.institution {
            Some(name) => InstitutionHint::Known(name.clone()),
            None => InstitutionHint::Unknown,
        }
    }
}

/// Internal pairing of a pattern row with its compiled regex.
struct CompiledPattern {
    institution: String,
    regex: Regex,
}

/// Scans raw text for a known sender. Rules are compiled once; the first match in
/// priority order wins.
pub struct PatternMatcher {
    patterns: Vec<CompiledPattern>,
}

impl PatternMatcher {
    /// Inactive rows and rows outside `country` are dropped. Malformed patterns are
    /// logged and skipped.
    pub fn new(mut rows: Vec<SourcePattern>, country: Option<&str>) -> Self {
        rows.sort_by_key(|r| r.id);
        let patterns = rows
            .into_iter()
            .filter(|r| r.is_active)
            .filter(|r| country.is_none_or(|c| r.country.eq_ignore_ascii_case(c)))
            .filter_map(|r| {
                match RegexBuilder::new(&r.pattern)
                    .case_insensitive(true)
                    .unicode(true)
                    .build()
                {
                    Ok(regex) => Some(CompiledPattern { institution: r.institution, regex }),
                    Err(e) => {
                        tracing::warn!(
                            pattern_id = r.id,
                            institution = %r.institution,
                            "skipping malformed source pattern: {e}"
                        );
                        None
                    }
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn match_text(&self, text: &str) -> MatchResult {
        self.patterns
            .iter()
            .find(|p| p.regex.is_match(text))
            .map(|p| MatchResult {
                institution: Some(p.institution.clone()),
                matched: true,
            })
            .unwrap_or_else(MatchResult::unmatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, institution: &str, pattern: &str, country: &str) -> SourcePattern {
        SourcePattern {
            id,
            institution: institution.to_string(),
            pattern: pattern.to_string(),
            country: country.to_string(),
            is_active: true,
        }
    }

    fn saudi() -> Vec<SourcePattern> {
        vec![
            row(1, "Al Rajhi Bank", r"al\s*rajhi|الراجحي", "SA"),
            row(2, "SNB AlAhli", r"\bsnb\b|alahli|الأهلي", "SA"),
            row(3, "Riyad Bank", r"riyad\s*bank|بنك\s*الرياض", "SA"),
        ]
    }

    #[test]
    fn matches_latin_case_insensitive() {
        let m = PatternMatcher::new(saudi(), None);
        let r = m.match_text("AL RAJHI BANK: POS purchase SAR 10");
        assert!(r.matched);
        assert_eq!(r.label(), "Al Rajhi Bank");
    }

    #[test]
    fn matches_arabic_name() {
        let m = PatternMatcher::new(saudi(), None);
        let r = m.match_text("مصرف الراجحي: شراء");
        assert_eq!(r.institution.as_deref(), Some("Al Rajhi Bank"));
    }

    #[test]
    fn unmatched_is_unknown() {
        let m = PatternMatcher::new(saudi(), None);
        let r = m.match_text("Your parcel is on its way");
        assert!(!r.matched);
        assert_eq!(r.label(), "unknown");
        assert_eq!(r.hint(), InstitutionHint::Unknown);
    }

    #[test]
    fn first_rule_in_insertion_order_wins() {
        let mut rows = saudi();
        rows.push(row(0, "Catch All", r"bank", "SA"));
        let m = PatternMatcher::new(rows, None);
        assert_eq!(m.match_text("Riyad Bank alert").label(), "Catch All");
    }

    #[test]
    fn malformed_pattern_is_skipped() {
        let mut rows = saudi();
        rows.insert(0, row(0, "Broken", r"(unclosed", "SA"));
        let m = PatternMatcher::new(rows, None);
        assert_eq!(m.len(), 3);
        assert_eq!(m.match_text("riyad bank").label(), "Riyad Bank");
    }

    #[test]
    fn country_filter_and_inactive_rows() {
        let mut rows = saudi();
        rows.push(row(10, "Emirates NBD", r"emirates\s*nbd", "AE"));
        rows[0].is_active = false;
        let m = PatternMatcher::new(rows, Some("sa"));
        assert_eq!(m.len(), 2);
        assert!(!m.match_text("Emirates NBD debit").matched);
        assert!(!m.match_text("Al Rajhi").matched);
    }
}
