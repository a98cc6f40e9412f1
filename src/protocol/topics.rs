//! Topic namespace partitioning and template variable substitution
//!
//! Every application on the gateway owns a slice of the broker's topic tree:
//!
//! ```text
//! [controlPrefix/]accountName/deviceId/appId/appTopic
//! ```
//!
//! Topics are built with template variables (`#account-name`, `#client-id`)
//! and resolved against the shared [`TopicContext`] when they reach the
//! transport, so the namespace survives reconfiguration of either value.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

pub const DEFAULT_CONTROL_PREFIX: &str = "$EDC";
pub const ACCOUNT_NAME_KEY: &str = "account-name";
pub const CLIENT_ID_KEY: &str = "client-id";
pub const ACCOUNT_NAME_VARIABLE: &str = "#account-name";
pub const CLIENT_ID_VARIABLE: &str = "#client-id";
pub const REPLY_TOPIC: &str = "REPLY";

// A variable name stops at whitespace, a separator or the next '#'.
static TOPIC_VARIABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#([^\s/#]+)").expect("valid topic variable pattern"));

/// Replace `/ + # .` in a raw client id with `-`
pub fn sanitize_client_id(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '/' | '+' | '#' | '.' => '-',
            other => other,
        })
        .collect()
}

/// Resolve `#name` tokens in a single pass; unknown names stay literal
pub fn substitute(template: &str, context: &HashMap<String, String>) -> String {
    TOPIC_VARIABLE
        .replace_all(template, |caps: &Captures| match context.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Shared key/value map used to resolve topic templates
#[derive(Debug, Default)]
pub struct TopicContext {
    variables: RwLock<HashMap<String, String>>,
}

impl TopicContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.variables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.variables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Replace the whole map at once so readers never see a half-updated context
    pub fn replace(&self, variables: HashMap<String, String>) {
        *self
            .variables
            .write()
            .unwrap_or_else(PoisonError::into_inner) = variables;
    }

    pub fn substitute(&self, template: &str) -> String {
        let variables = self.variables.read().unwrap_or_else(PoisonError::into_inner);
        substitute(template, &variables)
    }
}

/// Builds and parses wire topics for one control prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNamespace {
    control_prefix: String,
}

impl Default for TopicNamespace {
    fn default() -> Self {
        Self::new(DEFAULT_CONTROL_PREFIX)
    }
}

impl TopicNamespace {
    pub fn new(control_prefix: &str) -> Self {
        Self {
            control_prefix: control_prefix.to_string(),
        }
    }

    pub fn control_prefix(&self) -> &str {
        &self.control_prefix
    }

    /// Build `[controlPrefix/]account/device/app[/appTopic]`
    pub fn build_topic(
        &self,
        account_name: &str,
        device_id: &str,
        app_id: &str,
        app_topic: &str,
        is_control: bool,
    ) -> String {
        let mut topic = String::new();
        if is_control {
            topic.push_str(&self.control_prefix);
            topic.push('/');
        }
        topic.push_str(account_name);
        topic.push('/');
        topic.push_str(device_id);
        topic.push('/');
        topic.push_str(app_id);
        if !app_topic.is_empty() {
            topic.push('/');
            topic.push_str(app_topic);
        }
        topic
    }

    /// Control subscription that lets remote peers address an application
    pub fn default_subscription(&self, account_name: &str, device_id: &str, app_id: &str) -> String {
        self.build_topic(account_name, device_id, app_id, "#", true)
    }

    pub fn parse(&self, topic: &str) -> Option<ParsedTopic> {
        ParsedTopic::parse(topic, &self.control_prefix)
    }
}

/// Inbound topic split into its namespace components
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub prefix: Option<String>,
    pub account_name: String,
    pub device_id: String,
    pub app_id: String,
    pub app_topic: String,
    is_control: bool,
}

impl ParsedTopic {
    pub fn parse(topic: &str, control_prefix: &str) -> Option<Self> {
        let mut segments = topic.split('/').peekable();

        let prefix = match segments.peek() {
            Some(first) if first.starts_with('$') => segments.next().map(str::to_string),
            _ => None,
        };

        let account_name = segments.next().filter(|s| !s.is_empty())?.to_string();
        let device_id = segments.next().filter(|s| !s.is_empty())?.to_string();
        let app_id = segments.next().filter(|s| !s.is_empty())?.to_string();
        let app_topic = segments.collect::<Vec<_>>().join("/");
        let is_control = prefix.as_deref() == Some(control_prefix);

        Some(Self {
            prefix,
            account_name,
            device_id,
            app_id,
            app_topic,
            is_control,
        })
    }

    pub fn is_control(&self) -> bool {
        self.is_control
    }

    pub fn is_reply(&self) -> bool {
        self.app_topic == REPLY_TOPIC || self.app_topic.starts_with("REPLY/")
    }
}

/// Validate an application id before it becomes a topic segment
pub fn validate_app_id(app_id: &str) -> Result<(), ValidationError> {
    if app_id.is_empty() {
        return Err(ValidationError::EmptyAppId);
    }

    for ch in app_id.chars() {
        if matches!(ch, '/' | '+' | '#') || ch.is_whitespace() {
            return Err(ValidationError::InvalidAppIdChar(ch));
        }
    }

    Ok(())
}

/// Validation errors for topic segments
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Application id cannot be empty")]
    EmptyAppId,
    #[error("Application id contains invalid character: '{0}'")]
    InvalidAppIdChar(char),
}
