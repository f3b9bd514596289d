use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An authenticated identity as reported by the auth service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// One authenticated context. Issued and refreshed by the auth service;
/// the application only keeps a cached copy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Unix seconds
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub user: Option<Principal>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl Session {
    pub fn principal(&self) -> Option<&Principal> {
        self.user.as_ref()
    }

    /// Sessions without expiry metadata never count as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => now.timestamp() >= at,
            None => false,
        }
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

/// Session-change notifications published by the data-service client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    InitialSession(Option<Session>),
    SignedIn(Session),
    TokenRefreshed(Session),
    SignedOut,
}

impl AuthEvent {
    pub fn session(&self) -> Option<&Session> {
        match self {
            AuthEvent::InitialSession(session) => session.as_ref(),
            AuthEvent::SignedIn(session) | AuthEvent::TokenRefreshed(session) => Some(session),
            AuthEvent::SignedOut => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthEvent::InitialSession(_) => "INITIAL_SESSION",
            AuthEvent::SignedIn(_) => "SIGNED_IN",
            AuthEvent::TokenRefreshed(_) => "TOKEN_REFRESHED",
            AuthEvent::SignedOut => "SIGNED_OUT",
        }
    }
}

/// Role tags stored in `user_roles`. No ordering is implied between them.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
    Overseer,
    Editor,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Admin, Role::User, Role::Overseer, Role::Editor];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
            Role::Overseer => "overseer",
            Role::Editor => "editor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown role '{s}' (expected admin, user, overseer or editor)"))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RoleAssignment {
    pub user_id: String,
    pub role: Role,
}

/// Capabilities derived from the admin/overseer flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    AdminPanel,
    ManageContent,
    ManageRoles,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::AdminPanel => "admin panel",
            Capability::ManageContent => "manage content",
            Capability::ManageRoles => "manage roles",
        })
    }
}

/// Row of `profiles`. Registration survey answers ride along in `details`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Profile {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub date: NaiveDate,
    pub time: String,
    pub location: String,
    pub participants: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl Event {
    /// Everything except the description is required.
    pub fn validate(&self) -> crate::error::Result<()> {
        let required = [
            ("name", &self.name),
            ("time", &self.time),
            ("location", &self.location),
            ("participants", &self.participants),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(crate::error::Error::invalid(format!("event {field} is required")));
            }
        }
        Ok(())
    }
}

/// Row of `classroom_announcements`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Announcement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announcement_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classroom_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub creator_name: Option<String>,
    #[serde(default)]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Announcement {
    /// Announcement authored from the admin tooling rather than imported from a classroom feed.
    pub fn admin_created(
        title: Option<String>,
        text: &str,
        creator_name: String,
        now: DateTime<Utc>,
    ) -> crate::error::Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(crate::error::Error::invalid("announcement text is required"));
        }
        Ok(Self {
            id: None,
            announcement_id: Some(format!("admin-{}", now.timestamp_millis())),
            classroom_id: Some("admin-created".to_string()),
            title: title
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            text: Some(text.to_string()),
            creator_name: Some(creator_name),
            creation_time: Some(now),
            created_at: None,
        })
    }
}

/// JWT claims carried by access tokens.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AccessClaims {
    pub sub: String, // principal id
    pub exp: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// One user as shown in role management: profile plus every role row for that id.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub user_id: String,
    pub display_name: Option<String>,
    pub full_name: Option<String>,
    pub roles: BTreeSet<Role>,
}

impl DirectoryEntry {
    pub fn is_admin(&self) -> bool {
        self.roles.contains(&Role::Admin)
    }

    pub fn is_overseer(&self) -> bool {
        self.roles.contains(&Role::Overseer)
    }

    pub fn is_editor(&self) -> bool {
        self.roles.contains(&Role::Editor)
    }
}

/// Merge profiles and role rows. Role rows without a profile still produce an entry.
pub fn user_directory(profiles: &[Profile], assignments: &[RoleAssignment]) -> Vec<DirectoryEntry> {
    let mut entries: Vec<DirectoryEntry> = profiles
        .iter()
        .map(|p| DirectoryEntry {
            user_id: p.user_id.clone(),
            display_name: p.display_name.clone(),
            full_name: p
                .details
                .get("full_name")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            roles: BTreeSet::new(),
        })
        .collect();

    for assignment in assignments {
        match entries.iter_mut().find(|e| e.user_id == assignment.user_id) {
            Some(entry) => {
                entry.roles.insert(assignment.role);
            }
            None => entries.push(DirectoryEntry {
                user_id: assignment.user_id.clone(),
                display_name: None,
                full_name: None,
                roles: BTreeSet::from([assignment.role]),
            }),
        }
    }
    entries
}
