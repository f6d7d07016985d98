use std::str::FromStr;
use std::sync::OnceLock;

use chrono::NaiveDate;
use rasid_core::{Money, SourceKind, TransactionType};
use regex::Regex;
use rust_decimal::Decimal;

use crate::capability::{CapabilityError, TextUnderstanding};
use crate::types::{ExtractedField, ExtractedFields, InstitutionHint};

// ── Compiled regex cache ─────────────────────────────────────────────────────

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static R: OnceLock<Regex> = OnceLock::new();
            R.get_or_init(|| Regex::new($pat).expect("invalid regex"))
        }
    };
}

const NUM: &str = r"(\d[\d,]*(?:\.\d+)?)";

re!(re_amount_prefixed, &format!(r"(?i)(?:\bSAR|ر\.س|ريال)\s*:?\s*{NUM}"));
re!(re_amount_suffixed, &format!(r"(?i){NUM}\s*(?:SAR\b|ر\.س|ريال)"));
re!(re_amount_labeled, &format!(r"(?i)(?:\bamount|المبلغ|مبلغ)\s*:?\s*{NUM}"));

re!(re_payee_line,
    r"(?im)^\s*(?:at|merchant|payee|لدى|من|المتجر)\s*:\s*(.+?)\s*$");
re!(re_payee_inline,
    r"(?i)(?:\bat|من|لدى|في)\s+([A-Za-z\p{Arabic}][A-Za-z0-9&'.\-\s\p{Arabic}]*?)\s+(?:SAR\b|ر\.س|on\b|في)");
re!(re_payee_purchase,
    r"(?im)\bpurchase\s+(?:at|from)\s+([A-Za-z][A-Za-z0-9&'.\- ]*?)(?:\s+(?:SAR|on|for)\b|\s*$)");

re!(re_date_iso,
    r"\b(\d{4})[-/](\d{1,2})[-/](\d{1,2})\b");
re!(re_date_abbr_month,
    r"(?i)\b(\d{1,2})\s+(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?,?\s+(\d{4})\b");
re!(re_date_slash,
    r"\b(\d{1,2})/(\d{1,2})/(\d{2,4})\b");
re!(re_date_dash,
    r"\b(\d{1,2})-(\d{1,2})-(\d{2,4})\b");

re!(re_income,
    r"(?i)\b(?:credited|credit\s+(?:to|alert)|deposit(?:ed)?|received|salary)\b|إيداع|راتب|تحويل\s+وارد");

/// Payee pattern specific to one sender's message layout. Group 1 is the payee.
pub struct InstitutionTemplate {
    pub institution: String,
    payee: Regex,
}

impl InstitutionTemplate {
    pub fn new(institution: &str, payee_pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            institution: institution.to_string(),
            payee: Regex::new(payee_pattern)?,
        })
    }
}

const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    ("Al Rajhi Bank", r"(?im)^\s*(?:من|لدى|at|merchant)\s*:\s*([^\n]+?)\s*$"),
    ("SNB AlAhli", r"(?i)\bat\s+(.+?)\s+(?:on\b|for\b|SAR\b)"),
    ("Riyad Bank", r"(?im)^\s*(?:merchant|التاجر)\s*:\s*(.+?)\s*$"),
];

/// Regex-template extractor. Templates keyed by institution run first, then the
/// generic patterns every bank message tends to follow.
pub struct RuleExtractor {
    templates: Vec<InstitutionTemplate>,
}

impl Default for RuleExtractor {
    fn default() -> Self {
        let templates = BUILTIN_TEMPLATES
            .iter()
            .filter_map(|(inst, pat)| InstitutionTemplate::new(inst, pat).ok())
            .collect();
        Self { templates }
    }
}

impl RuleExtractor {
    pub fn new(templates: Vec<InstitutionTemplate>) -> Self {
        Self { templates }
    }

    /// Synchronous core of [`TextUnderstanding::extract`]. Never fails on partial text.
    pub fn read(&self, raw: &str, hint: &InstitutionHint, today: NaiveDate) -> ExtractedFields {
        let text = normalize_digits(raw);

        let (date, date_defaulted) = match extract_date(&text) {
            Some(d) => (Some(d), false),
            None => (Some(ExtractedField::new(today, 0.30)), true),
        };

        ExtractedFields {
            payee: self.extract_payee(&text, hint),
            amount: extract_amount(&text),
            date,
            transaction_type: if re_income().is_match(&text) {
                TransactionType::Income
            } else {
                TransactionType::Expense
            },
            date_defaulted,
        }
    }

    fn extract_payee(&self, text: &str, hint: &InstitutionHint) -> Option<ExtractedField<String>> {
        if let Some(name) = hint.name() {
            let from_template = self
                .templates
                .iter()
                .filter(|t| t.institution.eq_ignore_ascii_case(name))
                .find_map(|t| first_payee(&t.payee, text));
            if let Some(p) = from_template {
                return Some(ExtractedField::new(p, 0.85));
            }
        }

        [
            (re_payee_line(), 0.80f32),
            (re_payee_purchase(), 0.70),
            (re_payee_inline(), 0.65),
        ]
        .into_iter()
        .find_map(|(re, conf)| first_payee(re, text).map(|p| ExtractedField::new(p, conf)))
    }
}

impl TextUnderstanding for RuleExtractor {
    fn name(&self) -> &str {
        "rules"
    }

    async fn extract(
        &self,
        text: &str,
        _source: SourceKind,
        hint: &InstitutionHint,
        today: NaiveDate,
    ) -> Result<ExtractedFields, CapabilityError> {
        if text.trim().is_empty() {
            return Err(CapabilityError::EmptyInput);
        }
        Ok(self.read(text, hint, today))
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, CapabilityError> {
        Err(CapabilityError::Unsupported("embeddings"))
    }
}

// ── Payee helpers ────────────────────────────────────────────────────────────

fn first_payee(re: &Regex, text: &str) -> Option<String> {
    re.captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| clean_payee(m.as_str())))
        .find(|p| is_plausible_payee(p))
}

fn clean_payee(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| c.is_ascii_punctuation() && c != '&')
        .trim()
        .to_string()
}

fn is_plausible_payee(s: &str) -> bool {
    let len = s.chars().count();
    (2..=60).contains(&len)
        && s.chars().any(char::is_alphabetic)
        && !re_amount_prefixed().is_match(s)
        && !re_date_iso().is_match(s)
}

// ── Amount ───────────────────────────────────────────────────────────────────

fn extract_amount(text: &str) -> Option<ExtractedField<Money>> {
    [
        (re_amount_prefixed(), 0.90f32),
        (re_amount_suffixed(), 0.85),
        (re_amount_labeled(), 0.80),
    ]
    .into_iter()
    .find_map(|(re, conf)| {
        re.captures_iter(text)
            .filter_map(|c| parse_amount_str(c.get(1)?.as_str()))
            .next()
            .map(|m| ExtractedField::new(m, conf))
    })
}

/// Zero and unparseable amounts count as "not found".
fn parse_amount_str(s: &str) -> Option<Money> {
    let clean = s.replace(',', "");
    let dec = Decimal::from_str(clean.trim_end_matches('.')).ok()?;
    Money::from_decimal_lossy(dec).filter(|m| !m.is_zero() && !m.is_negative())
}

// ── Date ─────────────────────────────────────────────────────────────────────

fn extract_date(text: &str) -> Option<ExtractedField<NaiveDate>> {
    if let Some(d) = try_date_iso(text) {
        return Some(ExtractedField::new(d, 0.95));
    }
    if let Some(d) = try_date_abbr_month(text) {
        return Some(ExtractedField::new(d, 0.90));
    }
    if let Some(d) = try_day_first(re_date_slash(), text) {
        return Some(ExtractedField::new(d, 0.75));
    }
    if let Some(d) = try_day_first(re_date_dash(), text) {
        return Some(ExtractedField::new(d, 0.70));
    }
    None
}

fn try_date_iso(text: &str) -> Option<NaiveDate> {
    re_date_iso().captures_iter(text).find_map(|c| {
        let y: i32 = c.get(1)?.as_str().parse().ok()?;
        let m: u32 = c.get(2)?.as_str().parse().ok()?;
        let d: u32 = c.get(3)?.as_str().parse().ok()?;
        NaiveDate::from_ymd_opt(y, m, d)
    })
}

fn try_date_abbr_month(text: &str) -> Option<NaiveDate> {
    let c = re_date_abbr_month().captures(text)?;
    let day: u32 = c.get(1)?.as_str().parse().ok()?;
    let month = abbr_month_to_num(c.get(2)?.as_str())?;
    let year: i32 = c.get(3)?.as_str().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Saudi banks write DD/MM/YY; fall back to MM/DD when day-first is impossible.
fn try_day_first(re: &Regex, text: &str) -> Option<NaiveDate> {
    re.captures_iter(text).find_map(|c| {
        let p1: u32 = c.get(1)?.as_str().parse().ok()?;
        let p2: u32 = c.get(2)?.as_str().parse().ok()?;
        let year = expand_year(c.get(3)?.as_str().parse().ok()?);
        NaiveDate::from_ymd_opt(year, p2, p1).or_else(|| NaiveDate::from_ymd_opt(year, p1, p2))
    })
}

fn expand_year(y: i32) -> i32 {
    if y < 100 { 2000 + y } else { y }
}

fn abbr_month_to_num(name: &str) -> Option<u32> {
    match name.to_lowercase().as_str() {
        "jan" => Some(1), "feb" => Some(2), "mar" => Some(3), "apr" => Some(4),
        "may" => Some(5), "jun" => Some(6), "jul" => Some(7), "aug" => Some(8),
        "sep" => Some(9), "oct" => Some(10), "nov" => Some(11), "dec" => Some(12),
        _ => None,
    }
}

// ── Digits ───────────────────────────────────────────────────────────────────

/// Maps Arabic-Indic and Persian digits and separators onto ASCII.
fn normalize_digits(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{0660}'..='\u{0669}' => char::from(b'0' + (c as u32 - 0x0660) as u8),
            '\u{06F0}'..='\u{06F9}' => char::from(b'0' + (c as u32 - 0x06F0) as u8),
            '\u{066B}' => '.',
            '\u{066C}' => ',',
            other => other,
        })
        .collect()
}

// ── Tests ────────────────────────────────────────────────────────────────────
