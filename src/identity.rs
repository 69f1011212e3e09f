use std::future::Future;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::UserId;

/// The authenticated user a presence session speaks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Identity {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub avatar_url: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            email: None,
            name: None,
            avatar_url: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_avatar_url(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = Some(avatar_url.into());
        self
    }
}

/// Source of the current user's identity.
///
/// Returning `None` is not an error: presence simply stays inactive for
/// anonymous visitors.
pub trait IdentityProvider: Send + Sync + 'static {
    fn current_user(&self) -> impl Future<Output = Option<Identity>> + Send;
}

/// Identity provider backed by an already-known user (or none).
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity(Option<Identity>);

impl StaticIdentity {
    pub fn new(identity: Identity) -> Self {
        Self(Some(identity))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl From<Option<Identity>> for StaticIdentity {
    fn from(identity: Option<Identity>) -> Self {
        Self(identity)
    }
}

impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> Option<Identity> {
        self.0.clone()
    }
}
