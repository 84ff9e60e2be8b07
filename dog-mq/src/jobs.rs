//! Named queues and payloads used across the application.
//!
//! These are thin, typed callers of [`QueueService::add_job`]; the queue core
//! does not depend on them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::job::JobPayload;
use crate::service::QueueService;
use crate::types::{JobId, JobOptions};
use crate::QueueResult;

pub const EMAIL_QUEUE: &str = "email-queue";
pub const SEARCH_INDEX_QUEUE: &str = "search-index-queue";
pub const AI_PROCESSING_QUEUE: &str = "ai-processing-queue";
pub const NOTIFICATION_QUEUE: &str = "notification-queue";

/// Outgoing email rendered from a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEmail {
    pub to: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Template variables
    #[serde(default)]
    pub context: Value,
}

impl SendEmail {
    pub fn new(to: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            template: None,
            context: Value::Null,
        }
    }

    pub fn with_template(mut self, template: impl Into<String>, context: Value) -> Self {
        self.template = Some(template.into());
        self.context = context;
        self
    }
}

impl JobPayload for SendEmail {
    const QUEUE: &'static str = EMAIL_QUEUE;
    const JOB_TYPE: &'static str = "send-email";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IndexOperation {
    #[default]
    Upsert,
    Delete,
}

/// Add, refresh or remove a document in the search index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDocument {
    pub index: String,
    pub document_id: String,
    #[serde(default)]
    pub operation: IndexOperation,
    /// Document body; ignored for deletes
    #[serde(default)]
    pub document: Value,
}

impl IndexDocument {
    pub fn upsert(index: impl Into<String>, document_id: impl Into<String>, document: Value) -> Self {
        Self {
            index: index.into(),
            document_id: document_id.into(),
            operation: IndexOperation::Upsert,
            document,
        }
    }

    pub fn delete(index: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            document_id: document_id.into(),
            operation: IndexOperation::Delete,
            document: Value::Null,
        }
    }
}

impl JobPayload for IndexDocument {
    const QUEUE: &'static str = SEARCH_INDEX_QUEUE;
    const JOB_TYPE: &'static str = "index-document";

    fn default_options() -> JobOptions {
        JobOptions::new().with_retry_delay(Duration::from_secs(2))
    }
}

/// A model call whose result is written back to an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiProcessing {
    pub task: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub parameters: Value,
}

impl AiProcessing {
    pub fn new(task: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            prompt: prompt.into(),
            model: None,
            entity_id: None,
            parameters: Value::Null,
        }
    }
}

impl JobPayload for AiProcessing {
    const QUEUE: &'static str = AI_PROCESSING_QUEUE;
    const JOB_TYPE: &'static str = "ai-processing";

    fn default_options() -> JobOptions {
        JobOptions::new()
            .with_max_retries(2)
            .with_retry_delay(Duration::from_secs(30))
            .with_timeout(Duration::from_secs(120))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationChannel {
    #[default]
    InApp,
    Email,
    Push,
}

/// A user-facing notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendNotification {
    pub user_id: String,
    #[serde(default)]
    pub channel: NotificationChannel,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: Value,
}

impl SendNotification {
    pub fn new(user_id: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            channel: NotificationChannel::InApp,
            title: title.into(),
            body: body.into(),
            data: Value::Null,
        }
    }

    pub fn via(mut self, channel: NotificationChannel) -> Self {
        self.channel = channel;
        self
    }
}

impl JobPayload for SendNotification {
    const QUEUE: &'static str = NOTIFICATION_QUEUE;
    const JOB_TYPE: &'static str = "send-notification";
}

impl QueueService {
    pub async fn add_email_job(&self, email: &SendEmail, options: Option<JobOptions>) -> QueueResult<JobId> {
        self.enqueue_with(email, options.unwrap_or_else(SendEmail::default_options))
            .await
    }

    pub async fn add_indexing_job(&self, document: &IndexDocument, options: Option<JobOptions>) -> QueueResult<JobId> {
        self.enqueue_with(document, options.unwrap_or_else(IndexDocument::default_options))
            .await
    }

    pub async fn add_ai_job(&self, request: &AiProcessing, options: Option<JobOptions>) -> QueueResult<JobId> {
        self.enqueue_with(request, options.unwrap_or_else(AiProcessing::default_options))
            .await
    }

    pub async fn add_notification_job(
        &self,
        notification: &SendNotification,
        options: Option<JobOptions>,
    ) -> QueueResult<JobId> {
        self.enqueue_with(notification, options.unwrap_or_else(SendNotification::default_options))
            .await
    }
}
