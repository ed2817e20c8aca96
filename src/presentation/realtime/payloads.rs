//! Client payload shapes shared by both wire formats.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::infrastructure::pubsub::Metadata;
use crate::shared::validation::MAX_TOPIC_LENGTH;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct AuthPayload {
    #[validate(length(min = 1, max = 4096, message = "token must not be empty"))]
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TopicPayload {
    #[validate(length(min = 1, max = MAX_TOPIC_LENGTH))]
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PublishPayload {
    #[validate(length(min = 1, max = MAX_TOPIC_LENGTH))]
    pub topic: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}
