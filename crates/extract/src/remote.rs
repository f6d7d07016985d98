//! HTTP client for a hosted text-understanding model.
//!
//! The service exposes two endpoints:
//! * `POST {endpoint}/extract` with `{text, source, institution, today, model}` answering a JSON
//!   object with `payee`, `amount`, `date`, `transaction_type` and `is_transaction`.
//! * `POST {endpoint}/embed` with `{text, model}` answering `{embedding: [f32]}`.
//!
//! Models tend to wrap JSON in markdown fences; those are stripped before parsing.

use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;
use rasid_core::{CapabilityConfig, Money, SourceKind, TransactionType};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::capability::{CapabilityError, TextUnderstanding};
use crate::types::{ExtractedField, ExtractedFields, InstitutionHint};

/// Per-field confidence reported for model answers.
const MODEL_CONFIDENCE: f32 = 0.95;

pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    payee: Option<String>,
    amount: Option<serde_json::Value>,
    date: Option<String>,
    transaction_type: Option<String>,
    #[serde(default = "default_true")]
    is_transaction: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

impl HttpBackend {
    /// Returns `None` when no endpoint is configured.
    pub fn from_config(config: &CapabilityConfig) -> Result<Option<Self>, CapabilityError> {
        if config.endpoint.trim().is_empty() {
            return Ok(None);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| CapabilityError::Unavailable(e.to_string()))?;
        Ok(Some(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        }))
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<String, CapabilityError> {
        let mut request = self.client.post(format!("{}/{path}", self.endpoint)).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| CapabilityError::Unavailable(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CapabilityError::Unavailable(e.to_string()))?;
        if !status.is_success() {
            return Err(CapabilityError::Unavailable(format!("{path} returned {status}: {text}")));
        }
        Ok(text)
    }
}

impl TextUnderstanding for HttpBackend {
    fn name(&self) -> &str {
        &self.model
    }

    async fn extract(
        &self,
        text: &str,
        source: SourceKind,
        hint: &InstitutionHint,
        today: NaiveDate,
    ) -> Result<ExtractedFields, CapabilityError> {
        if text.trim().is_empty() {
            return Err(CapabilityError::EmptyInput);
        }
        let body = serde_json::json!({
            "text": text,
            "source": source.to_string(),
            "institution": hint.name(),
            "today": today.to_string(),
            "model": self.model,
        });
        let raw = self.post("extract", body).await?;
        let parsed: ExtractResponse = serde_json::from_str(strip_fences(&raw))
            .map_err(|e| CapabilityError::MalformedResponse(e.to_string()))?;
        tracing::debug!(model = %self.model, "model extraction parsed");
        Ok(map_response(parsed, today))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        let body = serde_json::json!({ "text": text, "model": self.model });
        let raw = self.post("embed", body).await?;
        let parsed: EmbedResponse = serde_json::from_str(strip_fences(&raw))
            .map_err(|e| CapabilityError::MalformedResponse(e.to_string()))?;
        if parsed.embedding.is_empty() {
            return Err(CapabilityError::MalformedResponse("empty embedding".into()));
        }
        Ok(parsed.embedding)
    }
}

fn strip_fences(raw: &str) -> &str {
    let s = raw.trim();
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn map_response(r: ExtractResponse, today: NaiveDate) -> ExtractedFields {
    let amount = if r.is_transaction {
        r.amount
            .as_ref()
            .and_then(json_decimal)
            .and_then(Money::from_decimal_lossy)
            .filter(|m| !m.is_zero() && !m.is_negative())
            .map(|m| ExtractedField::new(m, MODEL_CONFIDENCE))
    } else {
        None
    };

    let parsed_date = r
        .date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok());
    let date_defaulted = parsed_date.is_none();
    let date = Some(match parsed_date {
        Some(d) => ExtractedField::new(d, MODEL_CONFIDENCE),
        None => ExtractedField::new(today, 0.30),
    });

    let payee = r
        .payee
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .map(|p| ExtractedField::new(p, MODEL_CONFIDENCE));

    let transaction_type = r
        .transaction_type
        .as_deref()
        .and_then(|t| TransactionType::from_str(t).ok())
        .filter(|t| *t != TransactionType::Transfer)
        .unwrap_or_default();

    ExtractedFields { payee, amount, date, transaction_type, date_defaulted }
}

fn json_decimal(v: &serde_json::Value) -> Option<Decimal> {
    match v {
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        serde_json::Value::String(s) => Decimal::from_str(&s.replace(',', "")).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 20).unwrap()
    }

    fn parse(raw: &str) -> ExtractedFields {
        let r: ExtractResponse = serde_json::from_str(strip_fences(raw)).unwrap();
        map_response(r, today())
    }

    #[test]
    fn strips_json_fences() {
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_fences("  {}  "), "{}");
    }

    #[test]
    fn maps_full_answer() {
        let f = parse(
            r#"{"payee":"Jarir Bookstore","amount":250.0,"date":"2024-03-15","transaction_type":"expense"}"#,
        );
        assert_eq!(f.payee.unwrap().value, "Jarir Bookstore");
        assert_eq!(f.amount.unwrap().value, Money::from_cents(25_000));
        assert_eq!(f.date.unwrap().value, NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
        assert!(!f.date_defaulted);
        assert_eq!(f.transaction_type, TransactionType::Expense);
    }

    #[test]
    fn string_amount_and_income() {
        let f = parse(r#"{"amount":"9,000.00","transaction_type":"income"}"#);
        assert_eq!(f.amount.unwrap().value, Money::from_cents(900_000));
        assert_eq!(f.transaction_type, TransactionType::Income);
        assert!(f.date_defaulted);
        assert_eq!(f.date.unwrap().value, today());
    }

    #[test]
    fn not_a_transaction_drops_amount() {
        let f = parse(r#"{"payee":"OTP","amount":5,"is_transaction":false}"#);
        assert!(f.amount.is_none());
    }

    #[test]
    fn nonsense_type_defaults_to_expense() {
        let f = parse(r#"{"amount":1,"transaction_type":"transfer"}"#);
        assert_eq!(f.transaction_type, TransactionType::Expense);
    }

    #[test]
    fn no_endpoint_means_no_backend() {
        let config = CapabilityConfig::default();
        assert!(HttpBackend::from_config(&config).unwrap().is_none());
    }
}
