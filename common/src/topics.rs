/// Retained entity states, one topic per entity: `heating/state/<entity_id>`.
pub const TOPIC_STATE_PREFIX: &str = "heating/state/";
pub const TOPIC_STATE_WILDCARD: &str = "heating/state/#";

/// Service calls: `heating/service/<domain>/<service>`.
pub const TOPIC_SERVICE_PREFIX: &str = "heating/service/";
/// Replies to blocking service calls, matched by `request_id`.
pub const TOPIC_SERVICE_RESULT_WILDCARD: &str = "heating/service/+/+/result";
const SERVICE_RESULT_SUFFIX: &str = "/result";

pub const TOPIC_CMD_REFRESH: &str = "heating/cmnd/refresh";
pub const TOPIC_CMD_SCHEDULE_ENABLED: &str = "heating/cmnd/schedule/enabled";

pub fn service_topic(domain: &str, service: &str) -> String {
    format!("{TOPIC_SERVICE_PREFIX}{domain}/{service}")
}

pub fn service_result_topic(domain: &str, service: &str) -> String {
    format!("{}{SERVICE_RESULT_SUFFIX}", service_topic(domain, service))
}

pub fn is_service_result_topic(topic: &str) -> bool {
    topic.starts_with(TOPIC_SERVICE_PREFIX) && topic.ends_with(SERVICE_RESULT_SUFFIX)
}

pub fn snapshot_topic(entry_id: &str) -> String {
    format!("heating/controller/{entry_id}/snapshot")
}

/// Entity id carried by a state topic, if the topic is one.
pub fn entity_from_state_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(TOPIC_STATE_PREFIX)
        .filter(|entity| !entity.is_empty())
}
