//! AI-assisted feedback summaries.
//!
//! A single call to a generative-AI text endpoint with a fixed prompt
//! template. The trimmed response text is stored verbatim in
//! `feedback.ai_summary`.

use crate::config::SummarizerConfig;
use crate::model::now_rfc3339;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SummarizeError {
    #[error("summarizer unavailable: {0}")]
    Unavailable(String),
    #[error("summarizer request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("summarizer returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("summarizer returned no text")]
    EmptyResponse,
    #[error("feedback not found")]
    NotFound,
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

impl From<reqwest::Error> for SummarizeError {
    fn from(e: reqwest::Error) -> Self {
        Self::Request(e.without_url())
    }
}

pub trait FeedbackSummarizer {
    fn summarize(&self, prompt: &str) -> Result<String, SummarizeError>;
}

pub struct HttpSummarizer {
    client: reqwest::blocking::Client,
    url: String,
    api_key: String,
    max_tokens: u32,
    temperature: f32,
}

impl HttpSummarizer {
    pub fn from_config(cfg: &SummarizerConfig) -> Result<Self, SummarizeError> {
        let api_key = cfg.api_key().ok_or_else(|| {
            SummarizeError::Unavailable(format!("{} is not set", cfg.api_key_env))
        })?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            url: format!(
                "{}/{}:generateContent",
                cfg.endpoint.trim_end_matches('/'),
                cfg.model
            ),
            api_key,
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
        })
    }
}

impl FeedbackSummarizer for HttpSummarizer {
    fn summarize(&self, prompt: &str) -> Result<String, SummarizeError> {
        let body = request_body(prompt, self.max_tokens, self.temperature);
        debug!(url = %self.url, "calling summarizer");
        let resp = self
            .client
            .post(&self.url)
            .header("x-goog-api-key", self.api_key.as_str())
            .json(&body)
            .send()?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(SummarizeError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }
        let value: Value = resp.json()?;
        extract_text(&value).ok_or(SummarizeError::EmptyResponse)
    }
}

pub fn build_prompt(student_name: &str, class_name: &str, feedback: &str) -> String {
    format!(
        "You are assisting a homeroom teacher. Summarize the following teacher \
         feedback about student {student} (class {class}) in 2-3 concise \
         sentences for parents. Keep a constructive tone, mention strengths \
         first, then areas to improve. Do not invent facts.\n\n\
         Feedback:\n{feedback}",
        student = student_name,
        class = class_name,
        feedback = feedback.trim()
    )
}

fn request_body(prompt: &str, max_tokens: u32, temperature: f32) -> Value {
    json!({
        "contents": [{ "parts": [{ "text": prompt }] }],
        "generationConfig": {
            "maxOutputTokens": max_tokens,
            "temperature": temperature,
        }
    })
}

/// Pulls the first candidate's text out of a generateContent response.
pub fn extract_text(resp: &Value) -> Option<String> {
    let parts = resp
        .get("candidates")?
        .as_array()?
        .first()?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("");
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Summarizes one feedback row and stores the result.
pub fn summarize_feedback(
    conn: &Connection,
    feedback_id: &str,
    summarizer: &dyn FeedbackSummarizer,
) -> Result<String, SummarizeError> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT f.content, u.full_name, c.name
             FROM feedback f
             JOIN users u ON u.id = f.student_id
             JOIN classes c ON c.id = f.class_id
             WHERE f.id = ?",
            [feedback_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((content, student_name, class_name)) = row else {
        return Err(SummarizeError::NotFound);
    };

    let prompt = build_prompt(&student_name, &class_name, &content);
    let summary = summarizer.summarize(&prompt)?.trim().to_string();
    if summary.is_empty() {
        return Err(SummarizeError::EmptyResponse);
    }
    conn.execute(
        "UPDATE feedback SET ai_summary = ?, updated_at = ? WHERE id = ?",
        (&summary, now_rfc3339(), feedback_id),
    )?;
    info!(feedback_id, chars = summary.chars().count(), "feedback summarized");
    Ok(summary)
}
