//! Compiled service registry: name ↔ id lookups plus the local protocol
//! fingerprint.
//!
//! The registry is produced by a schema compiler outside this crate; here
//! it is consumed read-only by the codecs and the connection. API and
//! message services live in separate name spaces, ids are unique across
//! both (buffer envelopes carry ids, not names).

use std::collections::HashMap;

use super::ProtoInfo;
use crate::error::{OpResult, WirelinkError};

/// What a service does: request/response or fire-and-forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Request/response, correlated by sequence number.
    Api,
    /// Fire-and-forget message.
    Msg,
}

/// One compiled service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDef {
    /// Numeric id used by the buffer envelope.
    pub id: u16,
    /// Service name used by the text envelope and the public API.
    pub name: String,
    /// Request/response or fire-and-forget.
    pub kind: ServiceKind,
}

impl ServiceDef {
    /// Shorthand for an API service definition.
    pub fn api(id: u16, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            kind: ServiceKind::Api,
        }
    }

    /// Shorthand for a message service definition.
    pub fn msg(id: u16, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            kind: ServiceKind::Msg,
        }
    }
}

/// Read-only registry of compiled services.
#[derive(Debug)]
pub struct ServiceMap {
    services: Vec<ServiceDef>,
    api_by_name: HashMap<String, usize>,
    msg_by_name: HashMap<String, usize>,
    by_id: HashMap<u16, usize>,
    md5: String,
    last_modified: u64,
}

impl ServiceMap {
    /// Build a map from compiled services and the compiler's fingerprint.
    ///
    /// Fails on duplicate ids or duplicate names within one kind.
    pub fn new(
        services: Vec<ServiceDef>,
        md5: impl Into<String>,
        last_modified: u64,
    ) -> OpResult<Self> {
        let mut api_by_name = HashMap::new();
        let mut msg_by_name = HashMap::new();
        let mut by_id = HashMap::new();

        for (idx, svc) in services.iter().enumerate() {
            if by_id.insert(svc.id, idx).is_some() {
                return Err(WirelinkError::Envelope(format!(
                    "duplicate service id {}",
                    svc.id
                )));
            }
            let by_name = match svc.kind {
                ServiceKind::Api => &mut api_by_name,
                ServiceKind::Msg => &mut msg_by_name,
            };
            if by_name.insert(svc.name.clone(), idx).is_some() {
                return Err(WirelinkError::Envelope(format!(
                    "duplicate service name '{}'",
                    svc.name
                )));
            }
        }

        Ok(Self {
            services,
            api_by_name,
            msg_by_name,
            by_id,
            md5: md5.into(),
            last_modified,
        })
    }

    /// Look up an API service by name.
    pub fn api_by_name(&self, name: &str) -> Option<&ServiceDef> {
        self.api_by_name.get(name).map(|&i| &self.services[i])
    }

    /// Look up a message service by name.
    pub fn msg_by_name(&self, name: &str) -> Option<&ServiceDef> {
        self.msg_by_name.get(name).map(|&i| &self.services[i])
    }

    /// Look up any service by its numeric id.
    pub fn by_id(&self, id: u16) -> Option<&ServiceDef> {
        self.by_id.get(&id).map(|&i| &self.services[i])
    }

    /// Names of every message service, for pattern subscription.
    pub fn msg_names(&self) -> impl Iterator<Item = &str> {
        self.services
            .iter()
            .filter(|s| s.kind == ServiceKind::Msg)
            .map(|s| s.name.as_str())
    }

    /// All compiled services.
    pub fn services(&self) -> &[ServiceDef] {
        &self.services
    }

    /// The fingerprint of this map's definitions.
    pub fn md5(&self) -> &str {
        &self.md5
    }

    /// When the definitions were last modified (epoch milliseconds).
    pub fn last_modified(&self) -> u64 {
        self.last_modified
    }

    /// Descriptor advertised to peers on the first exchange.
    pub fn local_proto_info(&self) -> ProtoInfo {
        ProtoInfo {
            md5: self.md5.clone(),
            last_modified: self.last_modified,
            version: env!("CARGO_PKG_VERSION").to_string(),
            runtime: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> ServiceMap {
        ServiceMap::new(
            vec![
                ServiceDef::api(1, "Echo"),
                ServiceDef::api(2, "user/Login"),
                ServiceDef::msg(3, "Chat"),
                ServiceDef::msg(4, "room/Joined"),
            ],
            "deadbeef",
            1_700_000_000_000,
        )
        .unwrap()
    }

    #[test]
    fn test_lookups() {
        let map = sample_map();
        assert_eq!(map.api_by_name("Echo").unwrap().id, 1);
        assert_eq!(map.msg_by_name("Chat").unwrap().id, 3);
        assert_eq!(map.by_id(2).unwrap().name, "user/Login");
        assert!(map.api_by_name("Chat").is_none());
        assert!(map.msg_by_name("Echo").is_none());
        assert!(map.by_id(99).is_none());
    }

    #[test]
    fn test_msg_names() {
        let map = sample_map();
        let mut names: Vec<_> = map.msg_names().collect();
        names.sort();
        assert_eq!(names, vec!["Chat", "room/Joined"]);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let res = ServiceMap::new(
            vec![ServiceDef::api(1, "A"), ServiceDef::msg(1, "B")],
            "x",
            0,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_duplicate_name_rejected_within_kind() {
        let res = ServiceMap::new(
            vec![ServiceDef::api(1, "A"), ServiceDef::api(2, "A")],
            "x",
            0,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_same_name_allowed_across_kinds() {
        let map = ServiceMap::new(
            vec![ServiceDef::api(1, "Ping"), ServiceDef::msg(2, "Ping")],
            "x",
            0,
        )
        .unwrap();
        assert_eq!(map.api_by_name("Ping").unwrap().id, 1);
        assert_eq!(map.msg_by_name("Ping").unwrap().id, 2);
    }

    #[test]
    fn test_local_proto_info() {
        let map = sample_map();
        let info = map.local_proto_info();
        assert_eq!(info.md5, "deadbeef");
        assert_eq!(info.last_modified, 1_700_000_000_000);
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
    }
}
