use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A routable backend process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendServer {
    pub uid: String,
    pub name: String,
    pub address: SocketAddr,
    pub initial: bool,
    /// Replica groups owning this backend
    pub owners: Vec<String>,
}

impl BackendServer {
    #[must_use]
    pub fn from_endpoint(uid: &str, name: &str, endpoint: BackendEndpoint) -> Self {
        Self {
            uid: uid.to_string(),
            name: name.to_string(),
            address: endpoint.address,
            initial: endpoint.initial,
            owners: endpoint.owners,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> BackendEndpoint {
        BackendEndpoint {
            address: self.address,
            owners: self.owners.clone(),
            initial: self.initial,
        }
    }
}

/// Connection details of a backend, stored next to its name mapping so
/// followers can route without asking the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendEndpoint {
    pub address: SocketAddr,
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub initial: bool,
}

impl BackendEndpoint {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Selection algorithm of a load-balanced group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    #[default]
    RoundRobin,
    MinimumLoad,
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "round-robin" | "roundrobin" => Ok(Self::RoundRobin),
            "minimum-load" | "minimumload" | "least-connections" => Ok(Self::MinimumLoad),
            other => Err(Error::InvalidValue(format!("unknown load balancing strategy: {other}"))),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoundRobin => f.write_str("round-robin"),
            Self::MinimumLoad => f.write_str("minimum-load"),
        }
    }
}

/// Per-group settings replicated alongside the group name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupOptions {
    #[serde(default)]
    pub initial: bool,
    #[serde(default)]
    pub strategy: StrategyKind,
}

impl GroupOptions {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// A load-balanced group as registered under its logical name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDescriptor {
    pub uid: String,
    pub name: String,
    pub options: GroupOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse() {
        assert_eq!("Round-Robin".parse::<StrategyKind>().unwrap(), StrategyKind::RoundRobin);
        assert_eq!("minimum-load".parse::<StrategyKind>().unwrap(), StrategyKind::MinimumLoad);
        assert!("random".parse::<StrategyKind>().is_err());
        assert_eq!(StrategyKind::MinimumLoad.to_string(), "minimum-load");
    }

    #[test]
    fn test_endpoint_json() {
        let json = r#"{"address":"10.0.0.7:25565","owners":["rs-1"]}"#;
        let endpoint = BackendEndpoint::from_json(json).unwrap();
        assert_eq!(endpoint.address, "10.0.0.7:25565".parse().unwrap());
        assert!(!endpoint.initial);

        let server = BackendServer::from_endpoint("uid-1", "lobby", endpoint.clone());
        assert_eq!(server.endpoint(), endpoint);
        assert!(BackendEndpoint::from_json("not json").is_err());
    }

    #[test]
    fn test_group_options_defaults() {
        let options = GroupOptions::from_json("{}").unwrap();
        assert_eq!(options, GroupOptions::default());
        assert_eq!(options.strategy, StrategyKind::RoundRobin);
    }
}
