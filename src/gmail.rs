use chrono::{DateTime, Utc};
use scraper::Html;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::models::{Folder, MessageRef};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const BATCH_MODIFY_LIMIT: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Gmail request failed with status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("failed to reach Gmail: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected Gmail data: {0}")]
    Decode(String),
}

pub trait MessageSource {
    /// Unmarked threads in `folder` no older than `max_age_days`.
    fn search(&self, folder: Folder, max_age_days: u32) -> Result<Vec<String>, SourceError>;

    /// Any sent thread mentioning `company`, regardless of age or marker.
    fn search_sent_mentioning(&self, company: &str) -> Result<Vec<String>, SourceError>;

    /// Messages of a thread, oldest first.
    fn fetch_thread(&self, thread_id: &str) -> Result<Vec<MessageRef>, SourceError>;

    fn mark_processed(&self, message_ids: &[String]) -> Result<(), SourceError>;

    fn is_processed(&self, message: &MessageRef) -> bool;
}

pub struct GmailConfig {
    pub access_token: String,
    pub processed_label: String,
}

// --- Gmail wire types ---

#[derive(Debug, Deserialize)]
struct ThreadStub {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadList {
    #[serde(default)]
    threads: Vec<ThreadStub>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct Payload {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: String,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    snippet: String,
    internal_date: String,
    #[serde(default)]
    payload: Payload,
}

#[derive(Debug, Deserialize)]
struct GmailThread {
    #[serde(default)]
    messages: Vec<GmailMessage>,
}

#[derive(Debug, Deserialize)]
struct Label {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewLabel<'a> {
    name: &'a str,
    label_list_visibility: &'a str,
    message_list_visibility: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchModify<'a> {
    ids: &'a [String],
    add_label_ids: [&'a str; 1],
}

// --- Gmail REST source ---

pub struct GmailSource {
    client: reqwest::blocking::Client,
    access_token: String,
    label_name: String,
    label_id: String,
}

impl GmailSource {
    /// Connects and resolves the processed-marker label, creating it on first use.
    pub fn connect(config: GmailConfig) -> Result<Self, SourceError> {
        let mut source = Self {
            client: reqwest::blocking::Client::new(),
            access_token: config.access_token.trim().to_string(),
            label_name: config.processed_label,
            label_id: String::new(),
        };
        source.label_id = source.ensure_label()?;
        Ok(source)
    }

    fn ensure_label(&self) -> Result<String, SourceError> {
        let list: LabelList = self.get("labels", &[])?;
        if let Some(label) = list.labels.into_iter().find(|l| l.name == self.label_name) {
            return Ok(label.id);
        }

        let body = NewLabel {
            name: &self.label_name,
            label_list_visibility: "labelShow",
            message_list_visibility: "show",
        };
        let response = self.post("labels", &body)?;
        let label: Label = response.json()?;
        info!("Created Gmail label '{}'", self.label_name);
        Ok(label.id)
    }

    fn get<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, SourceError> {
        let response = self
            .client
            .get(format!("{}/{}", GMAIL_API_BASE, path))
            .bearer_auth(&self.access_token)
            .query(query)
            .send()?;
        Ok(check_status(response)?.json()?)
    }

    fn post<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::blocking::Response, SourceError> {
        let response = self
            .client
            .post(format!("{}/{}", GMAIL_API_BASE, path))
            .bearer_auth(&self.access_token)
            .json(body)
            .send()?;
        check_status(response)
    }

    fn list_threads(&self, query: &str, all_pages: bool) -> Result<Vec<String>, SourceError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![("q", query)];
            if let Some(token) = page_token.as_deref() {
                params.push(("pageToken", token));
            }
            let page: ThreadList = self.get("threads", &params)?;
            ids.extend(page.threads.into_iter().map(|t| t.id));

            match page.next_page_token {
                Some(token) if all_pages => page_token = Some(token),
                _ => break,
            }
        }
        debug!(query, count = ids.len(), "Listed threads");
        Ok(ids)
    }
}

fn check_status(
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, SourceError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().unwrap_or_default();
    Err(SourceError::Http { status, body })
}

impl MessageSource for GmailSource {
    fn search(&self, folder: Folder, max_age_days: u32) -> Result<Vec<String>, SourceError> {
        self.list_threads(&window_query(folder, max_age_days, &self.label_name), true)
    }

    fn search_sent_mentioning(&self, company: &str) -> Result<Vec<String>, SourceError> {
        self.list_threads(&company_query(company), false)
    }

    fn fetch_thread(&self, thread_id: &str) -> Result<Vec<MessageRef>, SourceError> {
        let thread: GmailThread = self.get(
            &format!("threads/{}", thread_id),
            &[("format", "metadata"), ("metadataHeaders", "Subject")],
        )?;
        let mut messages = thread
            .messages
            .into_iter()
            .map(to_message_ref)
            .collect::<Result<Vec<_>, _>>()?;
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    fn mark_processed(&self, message_ids: &[String]) -> Result<(), SourceError> {
        for chunk in message_ids.chunks(BATCH_MODIFY_LIMIT) {
            let body = BatchModify {
                ids: chunk,
                add_label_ids: [self.label_id.as_str()],
            };
            self.post("messages/batchModify", &body)?;
            debug!(count = chunk.len(), "Marked messages processed");
        }
        Ok(())
    }

    fn is_processed(&self, message: &MessageRef) -> bool {
        message.labels.iter().any(|l| *l == self.label_id)
    }
}

fn window_query(folder: Folder, max_age_days: u32, label: &str) -> String {
    let scope = match folder {
        Folder::Sent => "from:me",
        Folder::Inbox => "in:inbox",
    };
    format!("{} newer_than:{}d -label:{}", scope, max_age_days, label)
}

fn company_query(company: &str) -> String {
    format!("from:me \"{}\"", company.replace('"', ""))
}

fn to_message_ref(message: GmailMessage) -> Result<MessageRef, SourceError> {
    let millis: i64 = message
        .internal_date
        .parse()
        .map_err(|_| SourceError::Decode(format!("bad internalDate '{}'", message.internal_date)))?;
    let timestamp = DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| SourceError::Decode(format!("internalDate out of range: {}", millis)))?;

    let subject = message
        .payload
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("subject"))
        .map(|h| h.value.clone())
        .unwrap_or_default();

    let folder = if message.label_ids.iter().any(|l| l == "SENT") {
        Folder::Sent
    } else {
        Folder::Inbox
    };

    Ok(MessageRef {
        folder,
        thread_id: message.thread_id,
        id: message.id,
        timestamp,
        labels: message.label_ids,
        subject,
        snippet: decode_snippet(&message.snippet),
    })
}

/// Gmail snippets arrive HTML-escaped (`&#39;`, `&amp;`).
fn decode_snippet(snippet: &str) -> String {
    Html::parse_fragment(snippet)
        .root_element()
        .text()
        .collect::<String>()
}

// --- Dry-run wrapper ---

/// Reads through to `inner` but never applies the processed marker.
pub struct ReadOnlySource<'a> {
    inner: &'a dyn MessageSource,
}

impl<'a> ReadOnlySource<'a> {
    pub fn new(inner: &'a dyn MessageSource) -> Self {
        Self { inner }
    }
}

impl MessageSource for ReadOnlySource<'_> {
    fn search(&self, folder: Folder, max_age_days: u32) -> Result<Vec<String>, SourceError> {
        self.inner.search(folder, max_age_days)
    }

    fn search_sent_mentioning(&self, company: &str) -> Result<Vec<String>, SourceError> {
        self.inner.search_sent_mentioning(company)
    }

    fn fetch_thread(&self, thread_id: &str) -> Result<Vec<MessageRef>, SourceError> {
        self.inner.fetch_thread(thread_id)
    }

    fn mark_processed(&self, message_ids: &[String]) -> Result<(), SourceError> {
        info!("[DRY RUN] Would mark {} message(s) processed", message_ids.len());
        Ok(())
    }

    fn is_processed(&self, message: &MessageRef) -> bool {
        self.inner.is_processed(message)
    }
}
