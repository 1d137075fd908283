//! Process role detection and child environment construction.
//!
//! The same executable serves as both master and worker; the only thing that
//! distinguishes the two is a reserved environment variable inspected at
//! startup. This module owns that variable and its siblings: the parent
//! contact endpoint, the handshake cookie, and the heartbeat
//! parameterization a spawner selects for its child.
//!
//! All functions here are pure over injected `(key, value)` pairs — actual
//! process-environment I/O is confined to the thin `*_from_process_env`
//! wrappers so tests can stage arbitrary environments.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    heartbeat::HeartbeatConfig,
};

/// Marks a process as a worker and carries its id. Absent on masters.
pub const ROLE_VAR: &str = "PARALLEL_ROLE";
/// `host:port` of the parent's reverse-handshake listener.
pub const PARENT_ADDR_VAR: &str = "PARALLEL_PARENT_ADDR";
/// Opaque token echoed back on the reverse handshake.
pub const PARENT_COOKIE_VAR: &str = "PARALLEL_PARENT_COOKIE";
/// `interval_ms/timeout_ms` heartbeat parameterization chosen at spawn.
pub const HEARTBEAT_VAR: &str = "PARALLEL_HEARTBEAT";
/// Wire serialization format, inherited from the spawner so both ends of
/// every stream frame alike.
pub const SERIALIZER_VAR: &str = "PARALLEL_SERIALIZER";

/// Keys owned by the library. Extra environment pairs may not override
/// these.
pub const RESERVED_VARS: [&str; 5] = [
    ROLE_VAR,
    PARENT_ADDR_VAR,
    PARENT_COOKIE_VAR,
    HEARTBEAT_VAR,
    SERIALIZER_VAR,
];

/// Opaque globally-unique worker identifier, assigned by the spawner.
///
/// Ids are hierarchical: the master hands out `w0`, `w1`, …; a worker `w0`
/// hands out `w0.0`, `w0.1`, … — so every process in the tree carries a
/// distinct id without coordination.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id a worker with this id assigns to its `seq`-th child.
    pub fn child(&self, seq: u64) -> WorkerId {
        WorkerId(format!("{}.{}", self.0, seq))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The classification of the current process, immutable for its lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker(WorkerId),
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => f.write_str("master"),
            Role::Worker(id) => write!(f, "worker {id}"),
        }
    }
}

impl Role {
    /// Classify a process from its environment pairs.
    ///
    /// The role marker being absent means master; present and non-empty
    /// means worker. A present-but-blank marker is a misconfiguration.
    pub fn detect<I, K, V>(vars: I) -> Result<Role>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        match lookup(vars, ROLE_VAR) {
            None => Ok(Role::Master),
            Some(id) if id.trim().is_empty() => Err(Error::EnvInvalid(id)),
            Some(id) => Ok(Role::Worker(WorkerId::new(id))),
        }
    }

    /// Classify the current process.
    pub fn from_process_env() -> Result<Role> {
        Self::detect(std::env::vars())
    }

    /// The id this role assigns to its `seq`-th spawned child.
    pub(crate) fn child_id(&self, seq: u64) -> WorkerId {
        match self {
            Role::Master => WorkerId::new(format!("w{seq}")),
            Role::Worker(id) => id.child(seq),
        }
    }
}

/// How a worker reaches back to the process that spawned it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentContact {
    /// `host:port` of the parent's one-shot handshake listener.
    pub addr: String,
    /// Token the child echoes so the parent can match the connection to the
    /// spawn that produced it.
    pub cookie: String,
}

/// Parent contact information from environment pairs.
///
/// Fails with `NoParent` for processes launched outside the framework;
/// callers choosing the optional heartbeat policy treat that as "serve
/// standalone".
pub fn parent_contact<I, K, V>(vars: I) -> Result<ParentContact>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    let mut addr = None;
    let mut cookie = None;
    for (key, value) in vars {
        match key.as_ref() {
            PARENT_ADDR_VAR => addr = Some(value.into()),
            PARENT_COOKIE_VAR => cookie = Some(value.into()),
            _ => {}
        }
    }
    Ok(ParentContact {
        addr: addr.ok_or(Error::NoParent)?,
        cookie: cookie.unwrap_or_default(),
    })
}

/// The wire serializer inherited from the spawner, if one is recorded.
pub fn serializer_from_vars<I, K, V>(vars: I) -> Result<Option<crate::config::Serializer>>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    match lookup(vars, SERIALIZER_VAR) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::EnvInvalid(raw)),
    }
}

/// The spawn-time heartbeat parameterization from environment pairs.
///
/// Falls back to `default` when the variable is absent; a present but
/// unparseable value is a misconfiguration.
pub fn heartbeat_from_vars<I, K, V>(vars: I, default: HeartbeatConfig) -> Result<HeartbeatConfig>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    match lookup(vars, HEARTBEAT_VAR) {
        None => Ok(default),
        Some(raw) => HeartbeatConfig::parse_env(&raw).ok_or(Error::EnvInvalid(raw)),
    }
}

/// Construct the environment pairs a spawned child inherits.
///
/// Sets the role marker to `id`, the parent-contact variables, the
/// heartbeat parameterization, and the wire serializer, then merges
/// `extra`. Reserved keys always carry the values chosen here, so any stale
/// markers inherited from this process are masked. Pure; performs no
/// environment I/O.
pub fn child_env(
    id: &WorkerId,
    parent_addr: &str,
    cookie: &str,
    heartbeat: HeartbeatConfig,
    serializer: crate::config::Serializer,
    extra: &[(String, String)],
) -> Result<Vec<(String, String)>> {
    for (key, _) in extra {
        if RESERVED_VARS.contains(&key.as_str()) {
            return Err(Error::ReservedEnvKey(key.clone()));
        }
    }

    let mut env = vec![
        (ROLE_VAR.to_string(), id.to_string()),
        (PARENT_ADDR_VAR.to_string(), parent_addr.to_string()),
        (PARENT_COOKIE_VAR.to_string(), cookie.to_string()),
        (HEARTBEAT_VAR.to_string(), heartbeat.env_value()),
        (SERIALIZER_VAR.to_string(), serializer.to_string()),
    ];
    env.extend(extra.iter().cloned());
    Ok(env)
}

fn lookup<I, K, V>(vars: I, wanted: &str) -> Option<String>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    vars.into_iter()
        .find(|(key, _)| key.as_ref() == wanted)
        .map(|(_, value)| value.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn absent_marker_is_master() {
        let role = Role::detect(vars(&[("PATH", "/usr/bin")])).unwrap();
        assert_eq!(role, Role::Master);
    }

    #[test]
    fn present_marker_is_worker() {
        let role = Role::detect(vars(&[(ROLE_VAR, "w3")])).unwrap();
        assert_eq!(role, Role::Worker(WorkerId::new("w3")));
    }

    #[test]
    fn blank_marker_is_invalid() {
        let err = Role::detect(vars(&[(ROLE_VAR, "  ")])).unwrap_err();
        assert!(matches!(err, Error::EnvInvalid(_)));
    }

    #[test]
    fn child_ids_are_hierarchical() {
        assert_eq!(Role::Master.child_id(0), WorkerId::new("w0"));
        let worker = Role::Worker(WorkerId::new("w1"));
        assert_eq!(worker.child_id(2), WorkerId::new("w1.2"));
    }

    #[test]
    fn child_env_sets_reserved_keys() {
        let env = child_env(
            &WorkerId::new("w0"),
            "127.0.0.1:4000",
            "cookie",
            HeartbeatConfig::from_millis(100, 500),
            crate::config::Serializer::Cbor,
            &vars(&[("RUST_LOG", "debug")]),
        )
        .unwrap();

        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .unwrap()
        };
        assert_eq!(get(ROLE_VAR), "w0");
        assert_eq!(get(PARENT_ADDR_VAR), "127.0.0.1:4000");
        assert_eq!(get(PARENT_COOKIE_VAR), "cookie");
        assert_eq!(get(HEARTBEAT_VAR), "100/500");
        assert_eq!(get(SERIALIZER_VAR), "cbor");
        assert_eq!(get("RUST_LOG"), "debug");
    }

    #[test]
    fn extra_may_not_override_reserved_keys() {
        let err = child_env(
            &WorkerId::new("w0"),
            "127.0.0.1:4000",
            "cookie",
            HeartbeatConfig::from_millis(100, 500),
            crate::config::Serializer::Postcard,
            &vars(&[(ROLE_VAR, "evil")]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ReservedEnvKey(key) if key == ROLE_VAR));
    }

    #[test]
    fn parent_contact_requires_address() {
        let err = parent_contact(vars(&[("PATH", "x")])).unwrap_err();
        assert!(matches!(err, Error::NoParent));

        let contact = parent_contact(vars(&[
            (PARENT_ADDR_VAR, "10.0.0.1:9"),
            (PARENT_COOKIE_VAR, "c"),
        ]))
        .unwrap();
        assert_eq!(contact.addr, "10.0.0.1:9");
        assert_eq!(contact.cookie, "c");
    }

    #[test]
    fn serializer_round_trips_through_env() {
        assert_eq!(serializer_from_vars(vars(&[("PATH", "x")])).unwrap(), None);
        assert_eq!(
            serializer_from_vars(vars(&[(SERIALIZER_VAR, "postcard")])).unwrap(),
            Some(crate::config::Serializer::Postcard)
        );
        let err = serializer_from_vars(vars(&[(SERIALIZER_VAR, "json")])).unwrap_err();
        assert!(matches!(err, Error::EnvInvalid(_)));
    }

    #[test]
    fn heartbeat_round_trips_through_env() {
        let config = HeartbeatConfig::from_millis(100, 500);
        let parsed = heartbeat_from_vars(
            vars(&[(HEARTBEAT_VAR, config.env_value().as_str())]),
            HeartbeatConfig::from_millis(1, 1),
        )
        .unwrap();
        assert_eq!(parsed, config);

        let err = heartbeat_from_vars(
            vars(&[(HEARTBEAT_VAR, "garbage")]),
            HeartbeatConfig::from_millis(1, 1),
        )
        .unwrap_err();
        assert!(matches!(err, Error::EnvInvalid(_)));
    }
}
