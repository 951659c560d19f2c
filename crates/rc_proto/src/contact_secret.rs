//! Per-peer contact-secrets record (C10 payload; persisted by `rc_session`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationRole {
    Initiator,
    Responder,
}

/// `drState` is the base64 ratchet snapshot (see `rc_session::session_store`);
/// it is opaque at this layer, which only needs to merge and transport it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactSecret {
    pub role: ConversationRole,
    pub conversation_token: String,
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_dr_init: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dr_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub peer_device_id: String,
    pub updated_at: DateTime<Utc>,
}

impl ContactSecret {
    /// Last-writer-wins merge used by the backup download path; the
    /// downgrade rules on the embedded `dr_state` are enforced one layer up
    /// by the session store, not here — this only picks the newer record.
    pub fn merge_newer(self, other: Self) -> Self {
        if other.updated_at > self.updated_at {
            other
        } else {
            self
        }
    }
}
