use crate::instance::InstanceHandle;
use crate::object::VERSION_ANY;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnounceInfo {
    pub exchange_id: u32,
    pub class_name: String,
    pub interface_id: u32,
    pub version: u32,
}

impl AnnounceInfo {
    pub fn new(exchange_id: u32, class_name: impl Into<String>, interface_id: u32, version: u32) -> Self {
        Self {
            exchange_id,
            class_name: class_name.into(),
            interface_id,
            version,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnounceReply {
    pub implementation: Option<InstanceHandle>,
    pub proxy_stub_path: String,
    pub trace_categories: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireMessage {
    Announce {
        sequence: u64,
        exchange_id: u32,
        #[serde(default)]
        class_name: String,
        interface_id: u32,
        #[serde(default = "version_any")]
        version: u32,
        #[serde(default, with = "handle_wire")]
        implementation: Option<InstanceHandle>,
    },
    AnnounceAck {
        sequence: u64,
        #[serde(default, with = "handle_wire")]
        implementation: Option<InstanceHandle>,
        #[serde(default)]
        proxy_stub_path: String,
        #[serde(default)]
        trace_categories: String,
    },
    ObjectRequest {
        sequence: u64,
        class_name: String,
        interface_id: u32,
        #[serde(default = "version_any")]
        version: u32,
    },
    ObjectResponse {
        sequence: u64,
        #[serde(default, with = "handle_wire")]
        implementation: Option<InstanceHandle>,
    },
    Terminate,
}

impl WireMessage {
    pub fn announce(sequence: u64, info: &AnnounceInfo, implementation: Option<InstanceHandle>) -> Self {
        Self::Announce {
            sequence,
            exchange_id: info.exchange_id,
            class_name: info.class_name.clone(),
            interface_id: info.interface_id,
            version: info.version,
            implementation,
        }
    }

    pub fn announce_ack(sequence: u64, reply: AnnounceReply) -> Self {
        Self::AnnounceAck {
            sequence,
            implementation: reply.implementation,
            proxy_stub_path: reply.proxy_stub_path,
            trace_categories: reply.trace_categories,
        }
    }

    pub fn sequence(&self) -> Option<u64> {
        match self {
            Self::Announce { sequence, .. }
            | Self::AnnounceAck { sequence, .. }
            | Self::ObjectRequest { sequence, .. }
            | Self::ObjectResponse { sequence, .. } => Some(*sequence),
            Self::Terminate => None,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Self::AnnounceAck { .. } | Self::ObjectResponse { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Announce { .. } => "announce",
            Self::AnnounceAck { .. } => "announce_ack",
            Self::ObjectRequest { .. } => "object_request",
            Self::ObjectResponse { .. } => "object_response",
            Self::Terminate => "terminate",
        }
    }

    pub fn into_announce_reply(self) -> Option<AnnounceReply> {
        match self {
            Self::AnnounceAck {
                implementation,
                proxy_stub_path,
                trace_categories,
                ..
            } => Some(AnnounceReply {
                implementation,
                proxy_stub_path,
                trace_categories,
            }),
            _ => None,
        }
    }
}

fn version_any() -> u32 {
    VERSION_ANY
}

/// Handles travel as plain integers with zero meaning "none".
mod handle_wire {
    use crate::instance::InstanceHandle;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<InstanceHandle>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.map(InstanceHandle::get).unwrap_or(0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<InstanceHandle>, D::Error> {
        let raw = Option::<u64>::deserialize(deserializer)?;
        Ok(raw.and_then(InstanceHandle::new))
    }
}
