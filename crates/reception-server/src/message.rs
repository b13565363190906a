//! Inbound message parsing and the plaintext envelope that gets encrypted.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ReceptionError;
use crate::intake::FileDescriptor;

/// A submission as received, before validation.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Plain(Map<String, Value>),
    /// Carries a `sig` field. Verification is not supported.
    Signed(Map<String, Value>),
}

impl InboundMessage {
    pub fn from_json(raw: Value) -> Result<Self, ReceptionError> {
        let Value::Object(fields) = raw else {
            return Err(ReceptionError::InvalidMessage(
                "expected a JSON object".to_string(),
            ));
        };

        if fields.get("sig").is_some_and(is_truthy) {
            Ok(Self::Signed(fields))
        } else {
            Ok(Self::Plain(fields))
        }
    }

    pub fn into_pending(self) -> Result<PendingMessage, ReceptionError> {
        match self {
            Self::Plain(fields) => PendingMessage::from_fields(&fields),
            Self::Signed(_) => Err(ReceptionError::NotImplemented("signed messages")),
        }
    }
}

/// Parse and validate a raw submission.
pub fn parse(raw: Value) -> Result<PendingMessage, ReceptionError> {
    InboundMessage::from_json(raw)?.into_pending()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub recipients: Vec<String>,
    pub content: String,
    pub reply_to: Option<String>,
    pub author: Option<String>,
    pub user_ids: Vec<String>,
    /// Unix seconds, stamped at parse time.
    pub posted_at: i64,
}

impl PendingMessage {
    fn from_fields(fields: &Map<String, Value>) -> Result<Self, ReceptionError> {
        let content = match fields.get("contenu") {
            Some(Value::String(content)) => content.clone(),
            Some(_) => {
                return Err(ReceptionError::InvalidMessage(
                    "contenu must be a string".to_string(),
                ))
            }
            None => return Err(ReceptionError::InvalidMessage("missing contenu".to_string())),
        };

        let recipients = fields
            .get("destinataires")
            .and_then(string_list)
            .filter(|list| !list.is_empty())
            .ok_or(ReceptionError::MissingRecipients)?;

        let user_ids = match fields.get("user_id") {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => string_list(value).ok_or_else(|| {
                ReceptionError::InvalidMessage("user_id must be a string or a list".to_string())
            })?,
        };

        Ok(Self {
            recipients,
            content,
            reply_to: optional_string(fields, "reply_to"),
            author: optional_string(fields, "auteur"),
            user_ids,
            posted_at: Utc::now().timestamp(),
        })
    }

    pub fn envelope(
        &self,
        metadata: Option<CallerMetadata>,
        files: Vec<FileDescriptor>,
    ) -> MessageEnvelope {
        MessageEnvelope {
            contenu: self.content.clone(),
            date_post: self.posted_at,
            destinataires: self.recipients.clone(),
            reply_to: self.reply_to.clone(),
            auteur: self.author.clone(),
            user_id: self.user_ids.clone(),
            metadata: metadata.filter(|m| !m.is_empty()),
            files,
        }
    }
}

/// Originating request details kept with the message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallerMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarded_for: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub real_ip: Option<String>,
}

impl CallerMetadata {
    pub fn is_empty(&self) -> bool {
        self.user_agent.is_none()
            && self.origin.is_none()
            && self.forwarded_for.is_none()
            && self.real_ip.is_none()
    }
}

/// Plaintext encrypted for the recipients. Field names are the wire names
/// the messaging domain reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub contenu: String,
    pub date_post: i64,
    pub destinataires: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auteur: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_id: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CallerMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileDescriptor>,
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// A single string or a list of strings, blanks dropped.
fn string_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(s) => Some(
            Some(s.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .into_iter()
                .collect(),
        ),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::trim))
            .filter(|item| *item != Some(""))
            .map(|item| item.map(str::to_string))
            .collect(),
        _ => None,
    }
}

fn optional_string(fields: &Map<String, Value>, key: &str) -> Option<String> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
