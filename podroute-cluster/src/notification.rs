//! Registry deltas and leadership events broadcast between instances

use crate::error::{Error, Result};
use crate::keys::KeySpace;

const LEADER_CHANGED: &str = "leader-changed";
const LEADER_LEAVE: &str = "leader-leave";
const ADD_POD: &str = "add:pod";
const DEL_POD: &str = "del:pod";
const ADD_LB: &str = "add:lb";
const DEL_LB: &str = "del:lb";

/// Every topic an instance listens to
pub const TOPICS: [&str; 6] = [LEADER_CHANGED, LEADER_LEAVE, ADD_POD, DEL_POD, ADD_LB, DEL_LB];

/// A message on one of the group's notification channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A new holder took the lease
    LeaderChanged { holder: String },
    /// The holder released the lease voluntarily
    LeaderLeft { holder: String },
    BackendAdded { uid: String, name: String },
    BackendDeleted { uid: String },
    GroupAdded { uid: String, name: String, initial: bool },
    GroupDeleted { uid: String },
}

impl Notification {
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::LeaderChanged { .. } => LEADER_CHANGED,
            Self::LeaderLeft { .. } => LEADER_LEAVE,
            Self::BackendAdded { .. } => ADD_POD,
            Self::BackendDeleted { .. } => DEL_POD,
            Self::GroupAdded { .. } => ADD_LB,
            Self::GroupDeleted { .. } => DEL_LB,
        }
    }

    #[must_use]
    pub fn channel(&self, keys: &KeySpace) -> String {
        keys.channel(self.topic())
    }

    #[must_use]
    pub fn payload(&self) -> String {
        match self {
            Self::LeaderChanged { holder } | Self::LeaderLeft { holder } => holder.clone(),
            Self::BackendAdded { uid, name } => format!("{uid}:{name}"),
            Self::GroupAdded { uid, name, initial } => format!("{uid}:{name}:{initial}"),
            Self::BackendDeleted { uid } | Self::GroupDeleted { uid } => uid.clone(),
        }
    }

    /// Leadership events make every instance re-run its election
    #[must_use]
    pub const fn is_leadership(&self) -> bool {
        matches!(self, Self::LeaderChanged { .. } | Self::LeaderLeft { .. })
    }

    /// Decode a message received on `channel`
    pub fn parse(keys: &KeySpace, channel: &str, payload: &str) -> Result<Self> {
        let malformed = |reason: &str| Error::MalformedMessage {
            channel: channel.to_string(),
            reason: reason.to_string(),
        };

        let topic = keys.topic(channel).ok_or_else(|| malformed("unknown channel"))?;
        let payload = payload.trim();
        if payload.is_empty() {
            return Err(malformed("empty payload"));
        }

        match topic {
            LEADER_CHANGED => Ok(Self::LeaderChanged {
                holder: payload.to_string(),
            }),
            LEADER_LEAVE => Ok(Self::LeaderLeft {
                holder: payload.to_string(),
            }),
            ADD_POD => {
                let (uid, name) = payload
                    .split_once(':')
                    .filter(|(uid, name)| !uid.is_empty() && !name.is_empty())
                    .ok_or_else(|| malformed("expected uid:name"))?;
                Ok(Self::BackendAdded {
                    uid: uid.to_string(),
                    name: name.to_string(),
                })
            }
            ADD_LB => {
                let mut parts = payload.splitn(3, ':');
                let (Some(uid), Some(name)) = (parts.next(), parts.next()) else {
                    return Err(malformed("expected uid:name:initial"));
                };
                if uid.is_empty() || name.is_empty() {
                    return Err(malformed("expected uid:name:initial"));
                }
                let initial = match parts.next() {
                    None => false,
                    Some(flag) => flag
                        .parse::<bool>()
                        .map_err(|_| malformed("initial flag is not a boolean"))?,
                };
                Ok(Self::GroupAdded {
                    uid: uid.to_string(),
                    name: name.to_string(),
                    initial,
                })
            }
            DEL_POD => Ok(Self::BackendDeleted {
                uid: payload.to_string(),
            }),
            DEL_LB => Ok(Self::GroupDeleted {
                uid: payload.to_string(),
            }),
            _ => Err(malformed("unknown topic")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> KeySpace {
        KeySpace::new("podroute:", "survival")
    }

    #[test]
    fn test_backend_added_payload() {
        let added = Notification::BackendAdded {
            uid: "0b7c".to_string(),
            name: "lobby".to_string(),
        };
        assert_eq!(added.payload(), "0b7c:lobby");
        assert_eq!(added.channel(&keys()), "podroute:notify:add:pod:survival");
    }

    #[test]
    fn test_parse_group_added() {
        let keys = keys();
        let parsed = Notification::parse(&keys, &keys.channel("add:lb"), "rs-1:shop:true").unwrap();
        assert_eq!(
            parsed,
            Notification::GroupAdded {
                uid: "rs-1".to_string(),
                name: "shop".to_string(),
                initial: true,
            }
        );

        // older publishers omit the flag
        let parsed = Notification::parse(&keys, &keys.channel("add:lb"), "rs-1:shop").unwrap();
        assert!(matches!(parsed, Notification::GroupAdded { initial: false, .. }));
    }

    #[test]
    fn test_parse_leadership() {
        let keys = keys();
        let parsed = Notification::parse(&keys, &keys.channel("leader-leave"), "Ab3dE6gH").unwrap();
        assert!(parsed.is_leadership());
        assert_eq!(parsed.payload(), "Ab3dE6gH");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let keys = keys();
        assert!(Notification::parse(&keys, &keys.channel("add:pod"), "no-separator").is_err());
        assert!(Notification::parse(&keys, &keys.channel("add:pod"), ":lobby").is_err());
        assert!(Notification::parse(&keys, &keys.channel("add:lb"), "rs-1:shop:maybe").is_err());
        assert!(Notification::parse(&keys, &keys.channel("del:pod"), "  ").is_err());
        assert!(Notification::parse(&keys, &keys.channel("rename:pod"), "x").is_err());
        assert!(Notification::parse(&keys, "elsewhere", "x").is_err());
    }
}
