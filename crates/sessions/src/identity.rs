//! Identity service — maps channel identities to interlocutors.
//!
//! A channel identity `(channel, channel_user_id)` belongs to exactly one
//! interlocutor per `(tenant, agent)`. Cross-channel auto-link by phone or
//! email collapses the same person across channels when the tenant policy
//! allows it.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ruche_domain::error::{Error, Result};
use ruche_domain::session::InterlocutorKind;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelIdentity {
    pub channel: String,
    pub channel_user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interlocutor {
    pub interlocutor_id: Uuid,
    pub kind: InterlocutorKind,
    /// Ordered: first entry is the identity that created the interlocutor.
    pub channel_identities: Vec<ChannelIdentity>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Contact attributes extracted from the envelope, used for auto-linking.
#[derive(Debug, Clone, Default)]
pub struct ContactHint {
    pub phone: Option<String>,
    pub email: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Atomic insert-or-select on the unique channel identity.
    /// Returns `(interlocutor_id, is_new)`.
    async fn resolve_or_create(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        channel: &str,
        channel_user_id: &str,
        hint: Option<&ContactHint>,
    ) -> Result<(Uuid, bool)>;

    /// Idempotently attach a channel identity to an interlocutor.
    /// Fails with [`Error::IdentityConflict`] if the identity already
    /// belongs to a different interlocutor.
    async fn link(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        interlocutor_id: Uuid,
        channel: &str,
        channel_user_id: &str,
    ) -> Result<()>;

    /// Detach a channel identity. When `create_new_interlocutor` is set the
    /// identity is re-homed onto a fresh interlocutor whose id is returned.
    async fn unlink(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        interlocutor_id: Uuid,
        channel: &str,
        channel_user_id: &str,
        create_new_interlocutor: bool,
    ) -> Result<Option<Uuid>>;

    async fn get(&self, tenant_id: Uuid, agent_id: Uuid, interlocutor_id: Uuid)
        -> Result<Option<Interlocutor>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type ScopeKey = (Uuid, Uuid);

#[derive(Default)]
struct Scope {
    /// (channel, channel_user_id) → interlocutor.
    by_identity: HashMap<ChannelIdentity, Uuid>,
    interlocutors: HashMap<Uuid, Interlocutor>,
}

/// Backing store for single-process deployments and tests. A network-backed
/// implementation satisfies the same trait in production.
pub struct MemoryIdentityStore {
    scopes: RwLock<HashMap<ScopeKey, Scope>>,
    auto_link: bool,
}

impl MemoryIdentityStore {
    pub fn new(cross_channel_auto_link: bool) -> Self {
        Self {
            scopes: RwLock::new(HashMap::new()),
            auto_link: cross_channel_auto_link,
        }
    }

    fn find_by_contact(scope: &Scope, hint: &ContactHint) -> Option<Uuid> {
        scope.interlocutors.values().find_map(|i| {
            let phone_match = matches!(
                (&i.phone, &hint.phone),
                (Some(a), Some(b)) if a == b
            );
            let email_match = matches!(
                (&i.email, &hint.email),
                (Some(a), Some(b)) if a == b
            );
            (phone_match || email_match).then_some(i.interlocutor_id)
        })
    }
}

#[async_trait]
impl IdentityService for MemoryIdentityStore {
    async fn resolve_or_create(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        channel: &str,
        channel_user_id: &str,
        hint: Option<&ContactHint>,
    ) -> Result<(Uuid, bool)> {
        let identity = ChannelIdentity {
            channel: channel.to_ascii_lowercase(),
            channel_user_id: channel_user_id.to_owned(),
        };

        let mut scopes = self.scopes.write();
        let scope = scopes.entry((tenant_id, agent_id)).or_default();

        // Select path: the identity is already mapped.
        if let Some(id) = scope.by_identity.get(&identity) {
            return Ok((*id, false));
        }

        // Auto-link path: another channel already knows this phone/email.
        if self.auto_link {
            if let Some(hint) = hint {
                if let Some(existing) = Self::find_by_contact(scope, hint) {
                    scope.by_identity.insert(identity.clone(), existing);
                    if let Some(i) = scope.interlocutors.get_mut(&existing) {
                        i.channel_identities.push(identity.clone());
                    }
                    tracing::info!(
                        %tenant_id,
                        interlocutor_id = %existing,
                        channel = %identity.channel,
                        "auto-linked channel identity by contact"
                    );
                    return Ok((existing, false));
                }
            }
        }

        // Insert path.
        let interlocutor_id = Uuid::new_v4();
        scope.by_identity.insert(identity.clone(), interlocutor_id);
        scope.interlocutors.insert(
            interlocutor_id,
            Interlocutor {
                interlocutor_id,
                kind: InterlocutorKind::Human,
                channel_identities: vec![identity],
                phone: hint.and_then(|h| h.phone.clone()),
                email: hint.and_then(|h| h.email.clone()),
                created_at: Utc::now(),
            },
        );
        Ok((interlocutor_id, true))
    }

    async fn link(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        interlocutor_id: Uuid,
        channel: &str,
        channel_user_id: &str,
    ) -> Result<()> {
        let identity = ChannelIdentity {
            channel: channel.to_ascii_lowercase(),
            channel_user_id: channel_user_id.to_owned(),
        };

        let mut scopes = self.scopes.write();
        let scope = scopes.entry((tenant_id, agent_id)).or_default();

        if !scope.interlocutors.contains_key(&interlocutor_id) {
            return Err(Error::NotFound(format!(
                "interlocutor {interlocutor_id}"
            )));
        }
        match scope.by_identity.get(&identity) {
            Some(owner) if *owner == interlocutor_id => return Ok(()),
            Some(owner) => {
                return Err(Error::IdentityConflict(format!(
                    "{}:{} already belongs to interlocutor {owner}",
                    identity.channel, identity.channel_user_id
                )));
            }
            None => {}
        }

        scope.by_identity.insert(identity.clone(), interlocutor_id);
        if let Some(i) = scope.interlocutors.get_mut(&interlocutor_id) {
            i.channel_identities.push(identity);
        }
        Ok(())
    }

    async fn unlink(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        interlocutor_id: Uuid,
        channel: &str,
        channel_user_id: &str,
        create_new_interlocutor: bool,
    ) -> Result<Option<Uuid>> {
        let identity = ChannelIdentity {
            channel: channel.to_ascii_lowercase(),
            channel_user_id: channel_user_id.to_owned(),
        };

        let mut scopes = self.scopes.write();
        let scope = scopes.entry((tenant_id, agent_id)).or_default();

        match scope.by_identity.get(&identity) {
            Some(owner) if *owner == interlocutor_id => {}
            Some(owner) => {
                return Err(Error::IdentityConflict(format!(
                    "{}:{} belongs to interlocutor {owner}, not {interlocutor_id}",
                    identity.channel, identity.channel_user_id
                )));
            }
            None => {
                return Err(Error::NotFound(format!(
                    "channel identity {}:{}",
                    identity.channel, identity.channel_user_id
                )));
            }
        }

        scope.by_identity.remove(&identity);
        if let Some(i) = scope.interlocutors.get_mut(&interlocutor_id) {
            i.channel_identities.retain(|ci| *ci != identity);
        }

        if !create_new_interlocutor {
            return Ok(None);
        }

        let new_id = Uuid::new_v4();
        scope.by_identity.insert(identity.clone(), new_id);
        scope.interlocutors.insert(
            new_id,
            Interlocutor {
                interlocutor_id: new_id,
                kind: InterlocutorKind::Human,
                channel_identities: vec![identity],
                phone: None,
                email: None,
                created_at: Utc::now(),
            },
        );
        Ok(Some(new_id))
    }

    async fn get(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        interlocutor_id: Uuid,
    ) -> Result<Option<Interlocutor>> {
        Ok(self
            .scopes
            .read()
            .get(&(tenant_id, agent_id))
            .and_then(|s| s.interlocutors.get(&interlocutor_id))
            .cloned())
    }
}
