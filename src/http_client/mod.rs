//! HTTP Client for Load-Testing a Running Gateway
//!
//! Sends the first `count` dataset instructions to `/predict` as one batch,
//! measures wall-clock latency and character throughput, and compares the
//! generated answers against the dataset's reference answers.
//!
//! Real network calls only; the blocking `reqwest` client is used so the
//! measurement is not affected by a runtime's scheduling.

use std::{
    fmt::Write as _,
    path::PathBuf,
    time::{Duration, Instant},
};

use reqwest::blocking::Client;
use serde::Serialize;

use crate::{
    dataset::{self, DatasetRecord},
    error::{GatewayError, Result},
};

/// Length of answer previews in the comparison table
pub const PREVIEW_CHARS: usize = 200;

/// Outcome of one `/predict` call
#[derive(Debug, Clone, PartialEq)]
pub enum PredictOutcome {
    /// HTTP 200 with the parsed answers
    Completed {
        /// Answers in request order
        answers: Vec<String>,
        /// Round-trip time
        elapsed: Duration,
    },
    /// Any non-200 status
    Rejected {
        /// HTTP status code
        status: u16,
        /// Raw response body
        body: String,
    },
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    prompt: &'a [String],
}

/// Blocking client for the `/predict` endpoint
#[derive(Debug, Clone)]
pub struct PredictClient {
    client: Client,
    url: String,
}

impl PredictClient {
    /// Create a client for `url` (the full `/predict` URL)
    ///
    /// # Errors
    ///
    /// `ConnectionError` if the HTTP client cannot be built
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::ConnectionError(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Target URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send all prompts in one request
    ///
    /// # Errors
    ///
    /// `ConnectionError` on transport failure, `FormatError` if a 200
    /// response carries no `response` field
    pub fn predict_batch(&self, prompts: &[String]) -> Result<PredictOutcome> {
        let start = Instant::now();
        let response = self
            .client
            .post(&self.url)
            .json(&BatchRequest { prompt: prompts })
            .send()
            .map_err(|e| GatewayError::ConnectionError(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().unwrap_or_default();
            return Ok(PredictOutcome::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = response.json().map_err(|e| GatewayError::FormatError {
            reason: format!("Failed to parse predict response: {e}"),
        })?;
        let elapsed = start.elapsed();

        Ok(PredictOutcome::Completed {
            answers: answers_from_body(&body)?,
            elapsed,
        })
    }
}

/// Extract the answers of a `{"response": ...}` body as a list
fn answers_from_body(body: &serde_json::Value) -> Result<Vec<String>> {
    let field = body.get("response").ok_or_else(|| GatewayError::FormatError {
        reason: "Predict response has no 'response' field".to_string(),
    })?;
    let text = |value: &serde_json::Value| match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Ok(match field {
        serde_json::Value::Array(items) => items.iter().map(text).collect(),
        single => vec![text(single)],
    })
}

/// Load-test settings
#[derive(Debug, Clone)]
pub struct LoadTestConfig {
    /// `/predict` URL
    pub url: String,
    /// Dataset file
    pub dataset: PathBuf,
    /// Records to send
    pub count: usize,
    /// Request timeout
    pub timeout: Duration,
    /// Records whose reference contains this marker are always shown
    pub focus: Option<String>,
    /// Warn when a focused answer contains this pattern
    pub flag: Option<String>,
    /// Leading records always shown
    pub preview: usize,
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000/predict".to_string(),
            dataset: PathBuf::from("train_base.json"),
            count: 100,
            timeout: Duration::from_secs(300),
            focus: Some("blockIdx".to_string()),
            flag: Some("blockDim.y".to_string()),
            preview: 5,
        }
    }
}

/// One generated-vs-reference row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    /// 1-based record number
    pub number: usize,
    /// Instruction sent
    pub instruction: String,
    /// Generated answer (trimmed)
    pub generated: String,
    /// Reference answer (trimmed)
    pub reference: String,
    /// Focused record whose answer contains the flag pattern
    pub flagged: bool,
}

/// Summary of a completed load test
#[derive(Debug, Clone)]
pub struct LoadTestReport {
    /// Prompts sent
    pub prompts: usize,
    /// Answers received
    pub answers: usize,
    /// Round-trip time
    pub elapsed: Duration,
    /// Characters across all answers
    pub total_chars: usize,
    /// Comparison rows (empty on count mismatch)
    pub comparisons: Vec<Comparison>,
}

impl LoadTestReport {
    /// Build a report from the sent records and received answers
    #[must_use]
    pub fn build(
        records: &[DatasetRecord],
        answers: &[String],
        elapsed: Duration,
        config: &LoadTestConfig,
    ) -> Self {
        let total_chars = answers.iter().map(|a| a.chars().count()).sum();
        let comparisons = if answers.len() == records.len() {
            compare(records, answers, config)
        } else {
            Vec::new()
        };
        Self {
            prompts: records.len(),
            answers: answers.len(),
            elapsed,
            total_chars,
            comparisons,
        }
    }

    /// Whether answer and prompt counts agree
    #[must_use]
    pub fn counts_match(&self) -> bool {
        self.prompts == self.answers
    }

    /// Generated characters per second
    #[must_use]
    pub fn chars_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_chars as f64 / secs
        } else {
            0.0
        }
    }

    /// Human-readable report
    #[must_use]
    pub fn render(&self) -> String {
        let rule = "=".repeat(30);
        let mut out = String::new();
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out, "Batch test succeeded");
        let _ = writeln!(out, "Total time: {:.2} s", self.elapsed.as_secs_f64());

        if self.counts_match() {
            let _ = writeln!(out, "Generated characters: {}", self.total_chars);
            let _ = writeln!(out, "Throughput: {:.2} chars/s", self.chars_per_sec());
            let _ = writeln!(out, "{rule}");
            let _ = writeln!(out, "Generated vs reference");
            let _ = writeln!(out, "{rule}");
            for row in &self.comparisons {
                let _ = writeln!(out, "[{}] {}", row.number, row.instruction);
                let _ = writeln!(out, "  generated: {}", truncate_chars(&row.generated, PREVIEW_CHARS));
                let _ = writeln!(out, "  reference: {}", truncate_chars(&row.reference, PREVIEW_CHARS));
                if row.flagged {
                    let _ = writeln!(out, "  WARNING: answer contains the flagged pattern");
                }
                let _ = writeln!(out, "{}", "-".repeat(50));
            }
        } else {
            let _ = writeln!(
                out,
                "WARNING: received {} answers for {} prompts",
                self.answers, self.prompts
            );
        }
        let _ = writeln!(out, "{rule}");
        out
    }
}

fn compare(records: &[DatasetRecord], answers: &[String], config: &LoadTestConfig) -> Vec<Comparison> {
    records
        .iter()
        .zip(answers)
        .enumerate()
        .filter_map(|(i, (record, answer))| {
            let reference = record.output.as_deref().unwrap_or("").trim();
            let focused = config
                .focus
                .as_deref()
                .is_some_and(|marker| reference.contains(marker));
            if i >= config.preview && !focused {
                return None;
            }
            let generated = answer.trim();
            let flagged = focused
                && config
                    .flag
                    .as_deref()
                    .is_some_and(|pattern| generated.contains(pattern));
            Some(Comparison {
                number: i + 1,
                instruction: record.instruction.clone(),
                generated: generated.to_string(),
                reference: reference.to_string(),
                flagged,
            })
        })
        .collect()
}

/// Truncate to `max` characters, appending `...` when shortened
#[must_use]
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Result of [`run_load_test`]
#[derive(Debug, Clone)]
pub enum LoadTestOutcome {
    /// Server answered 200
    Completed(LoadTestReport),
    /// Server answered with another status
    Rejected {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },
}

/// Run the load test described by `config`
///
/// # Errors
///
/// Unreadable dataset, transport failure or an unparseable 200 body
pub fn run_load_test(config: &LoadTestConfig) -> Result<LoadTestOutcome> {
    let mut records = dataset::load_records(&config.dataset)?;
    records.truncate(config.count);
    let prompts = dataset::instructions(&records);

    tracing::info!(prompts = prompts.len(), url = %config.url, "Sending batch");
    let client = PredictClient::new(config.url.clone(), config.timeout)?;

    Ok(match client.predict_batch(&prompts)? {
        PredictOutcome::Completed { answers, elapsed } => {
            LoadTestOutcome::Completed(LoadTestReport::build(&records, &answers, elapsed, config))
        },
        PredictOutcome::Rejected { status, body } => LoadTestOutcome::Rejected { status, body },
    })
}
