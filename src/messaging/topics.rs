//! Topic resolution for published outbox messages.

use crate::config::TopicConfig;
use crate::models::OutboxMessage;
use std::collections::HashMap;

/// Maps an outbox message to the broker topic it is published on.
///
/// Precedence: the message's routing key, then the configured route for its
/// event type, then the default topic.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    default_topic: String,
    routes: HashMap<String, String>,
}

impl TopicRouter {
    pub fn new(default_topic: impl Into<String>) -> Self {
        Self {
            default_topic: default_topic.into(),
            routes: HashMap::new(),
        }
    }

    pub fn from_config(config: &TopicConfig) -> Self {
        Self {
            default_topic: config.default_topic.clone(),
            routes: config.route_map(),
        }
    }

    pub fn with_route(mut self, message_type: impl Into<String>, topic: impl Into<String>) -> Self {
        self.routes.insert(message_type.into(), topic.into());
        self
    }

    /// Topic for an event type ignoring any per-message routing key
    pub fn topic_for_type(&self, message_type: &str) -> &str {
        self.routes
            .get(message_type)
            .map(String::as_str)
            .unwrap_or(&self.default_topic)
    }

    pub fn resolve<'a>(&'a self, message: &'a OutboxMessage) -> &'a str {
        match message.routing_key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => self.topic_for_type(&message.message_type),
        }
    }

    pub fn default_topic(&self) -> &str {
        &self.default_topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewOutboxMessage;
    use chrono::Utc;

    #[test]
    fn test_resolution_precedence() {
        let router = TopicRouter::new("integration-events").with_route("TaskCreated", "tasks");

        let routed = NewOutboxMessage::new("TaskCreated", "{}").into_message(Utc::now());
        assert_eq!(router.resolve(&routed), "tasks");

        let keyed = NewOutboxMessage::new("TaskCreated", "{}")
            .with_routing_key("tasks.workspace-7")
            .into_message(Utc::now());
        assert_eq!(router.resolve(&keyed), "tasks.workspace-7");

        let unrouted = NewOutboxMessage::new("ChatMessagePosted", "{}").into_message(Utc::now());
        assert_eq!(router.resolve(&unrouted), "integration-events");
    }
}
