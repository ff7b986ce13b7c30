//! Topic addressing and wildcard matching.

use serde::{Deserialize, Serialize};

/// Structured form of a fabric topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// "evt" or "cmd"
    pub msg_type: String,
    pub resource_type: String,
    pub resource_name: String,
    pub resource_address: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub service_address: String,
}

impl Address {
    pub fn new(msg_type: &str, resource_type: &str, resource_name: &str, resource_address: &str) -> Self {
        Self {
            msg_type: msg_type.into(),
            resource_type: resource_type.into(),
            resource_name: resource_name.into(),
            resource_address: resource_address.into(),
            service_name: String::new(),
            service_address: String::new(),
        }
    }

    pub fn with_service(mut self, service_name: &str, service_address: &str) -> Self {
        self.service_name = service_name.into();
        self.service_address = service_address.into();
        self
    }

    pub fn to_topic(&self) -> String {
        let mut topic = format!(
            "pt:j1/mt:{}/rt:{}/rn:{}/ad:{}",
            self.msg_type, self.resource_type, self.resource_name, self.resource_address
        );
        if !self.service_name.is_empty() {
            topic.push_str(&format!("/sv:{}/ad:{}", self.service_name, self.service_address));
        }
        topic
    }

    /// Parse a concrete topic; `None` for topics outside the convention or containing wildcards
    pub fn parse(topic: &str) -> Option<Self> {
        let segments: Vec<&str> = topic.split('/').collect();
        if segments.len() != 5 && segments.len() != 7 {
            return None;
        }
        if segments.iter().any(|s| *s == "+" || *s == "#") {
            return None;
        }
        let value = |idx: usize, prefix: &str| segments[idx].strip_prefix(prefix).map(str::to_string);

        if segments[0] != "pt:j1" {
            return None;
        }
        let mut address = Address {
            msg_type: value(1, "mt:")?,
            resource_type: value(2, "rt:")?,
            resource_name: value(3, "rn:")?,
            resource_address: value(4, "ad:")?,
            service_name: String::new(),
            service_address: String::new(),
        };
        if segments.len() == 7 {
            address.service_name = value(5, "sv:")?;
            address.service_address = value(6, "ad:")?;
        }
        Some(address)
    }
}

/// MQTT-style match: `+` matches exactly one level, `#` matches the remainder
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENSOR: &str = "pt:j1/mt:evt/rt:dev/rn:test/ad:1/sv:sensor_lumin/ad:199_0";

    #[test]
    fn address_round_trips_through_topic() {
        let address = Address::new("evt", "dev", "test", "1").with_service("sensor_lumin", "199_0");
        assert_eq!(address.to_topic(), SENSOR);
        assert_eq!(Address::parse(SENSOR), Some(address));
    }

    #[test]
    fn short_topic_has_no_service() {
        let address = Address::parse("pt:j1/mt:cmd/rt:app/rn:flowway/ad:1").unwrap();
        assert_eq!(address.resource_name, "flowway");
        assert!(address.service_name.is_empty());
    }

    #[test]
    fn foreign_topics_are_not_addresses() {
        assert!(Address::parse("sensors/kitchen/temp").is_none());
        assert!(Address::parse("pt:j1/mt:evt/rt:dev/rn:+/ad:1").is_none());
    }

    #[test]
    fn wildcards() {
        assert!(topic_matches(SENSOR, SENSOR));
        assert!(topic_matches("pt:j1/mt:evt/rt:dev/+/+/sv:sensor_lumin/+", SENSOR));
        assert!(topic_matches("pt:j1/mt:evt/#", SENSOR));
        assert!(topic_matches("#", SENSOR));
        assert!(!topic_matches("pt:j1/mt:cmd/#", SENSOR));
        assert!(!topic_matches("pt:j1/mt:evt/rt:dev", SENSOR));
        assert!(!topic_matches("pt:j1/mt:evt/rt:dev/rn:test/ad:1/sv:sensor_lumin/ad:199_0/x", SENSOR));
    }
}
