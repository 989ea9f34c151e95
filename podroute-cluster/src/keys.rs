//! Shared-store key and channel names for one coordination group

/// Builds every key and channel used by a coordination group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
    group: String,
}

impl KeySpace {
    #[must_use]
    pub fn new(prefix: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            group: group.into(),
        }
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[must_use]
    pub fn leader(&self) -> String {
        format!("{}leader:{}", self.prefix, self.group)
    }

    #[must_use]
    pub fn proxy_id(&self, id: &str) -> String {
        format!("{}proxy-id:{}:{id}", self.prefix, self.group)
    }

    /// Hash: backend uid -> logical name
    #[must_use]
    pub fn servers(&self) -> String {
        format!("{}servers:{}", self.prefix, self.group)
    }

    /// Hash: backend uid -> endpoint JSON
    #[must_use]
    pub fn endpoints(&self) -> String {
        format!("{}endpoints:{}", self.prefix, self.group)
    }

    /// Hash: group uid -> logical name
    #[must_use]
    pub fn load_balancers(&self) -> String {
        format!("{}load-balancers:{}", self.prefix, self.group)
    }

    /// Hash: group uid -> options JSON
    #[must_use]
    pub fn load_balancer_options(&self) -> String {
        format!("{}load-balancer-options:{}", self.prefix, self.group)
    }

    /// Channel for a notification topic such as `add:pod`
    #[must_use]
    pub fn channel(&self, topic: &str) -> String {
        format!("{}notify:{topic}:{}", self.prefix, self.group)
    }

    /// Recover the topic of a channel built by [`KeySpace::channel`]
    #[must_use]
    pub fn topic<'a>(&self, channel: &'a str) -> Option<&'a str> {
        channel
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix("notify:")?
            .strip_suffix(self.group.as_str())?
            .strip_suffix(':')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        let keys = KeySpace::new("podroute:", "survival");
        assert_eq!(keys.leader(), "podroute:leader:survival");
        assert_eq!(keys.proxy_id("Ab3dE6gH"), "podroute:proxy-id:survival:Ab3dE6gH");
        assert_eq!(keys.servers(), "podroute:servers:survival");
        assert_eq!(keys.load_balancers(), "podroute:load-balancers:survival");
        assert_eq!(keys.channel("add:pod"), "podroute:notify:add:pod:survival");
    }

    #[test]
    fn test_topic_round_trip() {
        let keys = KeySpace::new("podroute:", "survival");
        assert_eq!(keys.topic(&keys.channel("del:lb")), Some("del:lb"));
        assert_eq!(keys.topic("podroute:notify:add:pod:creative"), None);
        assert_eq!(keys.topic("other:notify:add:pod:survival"), None);
    }
}
