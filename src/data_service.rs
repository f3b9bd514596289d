//! Client for the hosted data service.
//!
//! [`DataService`] is the slice the authorization gate depends on: the current
//! session, session-change notifications, the two role RPCs and the profile
//! lookup. [`RestDataService`] implements it over HTTP and adds the auth
//! primitives and table CRUD used by the CLI and seed tooling.
//!
//! Calls go either straight to the service (`Transport::Direct`, public key
//! headers) or through the edge proxy (`Transport::Proxied`), in which case
//! the caller's bearer token travels in the envelope's `headers` and takes
//! precedence over the proxy's injected one.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::session_from_token;
use crate::error::{Error, Result};
use crate::models::{
    Announcement, AuthEvent, Event, Principal, Profile, Role, RoleAssignment, Session,
};
use crate::storage::SessionStore;

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// What the authorization gate needs from the data service.
#[async_trait]
pub trait DataService: Send + Sync + 'static {
    /// The persisted session, if any. Expired sessions are refreshed or dropped.
    async fn current_session(&self) -> Result<Option<Session>>;

    /// Session-change notifications from now on.
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;

    /// `is_admin` RPC, scoped to the session's principal.
    async fn is_admin(&self, session: &Session) -> Result<bool>;

    /// `is_overseer` RPC, scoped to the session's principal.
    async fn is_overseer(&self, session: &Session) -> Result<bool>;

    /// At most one profile row for `user_id`.
    async fn profile(&self, session: &Session, user_id: &str) -> Result<Option<Profile>>;
}

#[derive(Debug, Clone)]
pub enum Transport {
    Direct { base_url: String, anon_key: String },
    Proxied { proxy_url: String },
}

/// Request body accepted by the edge proxy.
#[derive(Serialize, Debug)]
struct OutboundEnvelope<'a> {
    endpoint: &'a str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a Value>,
    headers: BTreeMap<&'a str, String>,
}

/// Result of a sign-up: the service returns a session when no email
/// confirmation is pending, otherwise only the new user.
#[derive(Debug, Clone, PartialEq)]
pub enum SignUpOutcome {
    SignedIn(Session),
    ConfirmationPending(Principal),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(Session),
    User(Principal),
}

pub struct RestDataService {
    client: Client,
    transport: Transport,
    store: SessionStore,
    events: broadcast::Sender<AuthEvent>,
    jwt_secret: Option<Vec<u8>>,
}

impl RestDataService {
    pub fn new(transport: Transport, store: SessionStore) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client: Client::new(),
            transport,
            store,
            events,
            jwt_secret: None,
        }
    }

    pub fn with_jwt_secret(mut self, secret: Option<&[u8]>) -> Self {
        self.jwt_secret = secret.map(<[u8]>::to_vec);
        self
    }

    // --- auth ---

    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        let body = json!({ "email": email, "password": password });
        let text = self
            .send(Method::POST, "/auth/v1/token?grant_type=password", Some(&body), None, &[])
            .await?;
        let session = self.accept_session(serde_json::from_str(&text)?)?;
        info!(principal = ?session.principal().map(|p| &p.id), "signed in");
        self.publish(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    /// Adopt an access token obtained elsewhere (magic link, OTP flow).
    pub async fn sign_in_with_token(&self, token: &str) -> Result<Session> {
        let session = session_from_token(token, self.jwt_secret.as_deref())?;
        self.store.save(&session)?;
        self.publish(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    /// Register a user and create their profile row.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Result<SignUpOutcome> {
        let body = json!({ "email": email, "password": password });
        let text = self.send(Method::POST, "/auth/v1/signup", Some(&body), None, &[]).await?;
        let (outcome, principal, session) = match serde_json::from_str::<SignUpResponse>(&text)? {
            SignUpResponse::Session(session) => {
                let session = self.accept_session(session)?;
                // the session is live from here on, whatever happens to the profile row
                self.publish(AuthEvent::SignedIn(session.clone()));
                let principal = session.principal().cloned().ok_or(Error::NotSignedIn)?;
                (SignUpOutcome::SignedIn(session.clone()), principal, Some(session))
            }
            SignUpResponse::User(principal) => (
                SignUpOutcome::ConfirmationPending(principal.clone()),
                principal,
                None,
            ),
        };

        let profile = Profile {
            user_id: principal.id.clone(),
            display_name: display_name.map(str::to_string),
            details: Default::default(),
        };
        self.create_profile(session.as_ref(), &profile).await?;
        Ok(outcome)
    }

    /// Revoke the session upstream (best effort) and forget it locally.
    pub async fn sign_out(&self) -> Result<()> {
        if let Some(session) = self.store.load()? {
            if let Err(e) = self
                .send(Method::POST, "/auth/v1/logout", None, Some(&session), &[])
                .await
            {
                warn!("upstream logout failed: {e}");
            }
        }
        self.store.clear()?;
        self.publish(AuthEvent::SignedOut);
        Ok(())
    }

    pub async fn refresh_session(&self, session: &Session) -> Result<Session> {
        let refresh_token = session.refresh_token.as_deref().ok_or(Error::NotSignedIn)?;
        let body = json!({ "refresh_token": refresh_token });
        let text = self
            .send(Method::POST, "/auth/v1/token?grant_type=refresh_token", Some(&body), None, &[])
            .await?;
        let refreshed = self.accept_session(serde_json::from_str(&text)?)?;
        self.publish(AuthEvent::TokenRefreshed(refreshed.clone()));
        Ok(refreshed)
    }

    // --- remote procedures ---

    pub async fn rpc_bool(&self, session: &Session, function: &str, args: Value) -> Result<bool> {
        let endpoint = format!("/rest/v1/rpc/{function}");
        let text = self
            .send(Method::POST, &endpoint, Some(&args), Some(session), &[])
            .await?;
        // a null result counts as false
        Ok(serde_json::from_str::<Option<bool>>(&text)?.unwrap_or(false))
    }

    pub async fn has_role(&self, session: &Session, user_id: &str, role: Role) -> Result<bool> {
        self.rpc_bool(session, "has_role", json!({ "_user_id": user_id, "_role": role }))
            .await
    }

    // --- profiles ---

    pub async fn list_profiles(&self, session: &Session) -> Result<Vec<Profile>> {
        self.get_rows(session, "/rest/v1/profiles?select=user_id,display_name,full_name")
            .await
    }

    /// Without a session the anon key is used, which only works when the table allows it.
    pub async fn create_profile(&self, session: Option<&Session>, profile: &Profile) -> Result<()> {
        let body = serde_json::to_value(profile)?;
        self.send(
            Method::POST,
            "/rest/v1/profiles",
            Some(&body),
            session,
            &[("Prefer", "return=minimal")],
        )
        .await?;
        Ok(())
    }

    // --- events ---

    pub async fn list_events(&self, session: Option<&Session>) -> Result<Vec<Event>> {
        let text = self
            .send(Method::GET, "/rest/v1/events?select=*&order=date.asc", None, session, &[])
            .await?;
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn create_event(&self, session: &Session, event: &Event) -> Result<Event> {
        event.validate()?;
        let mut event = event.clone();
        if event.created_by.is_none() {
            event.created_by = session.principal().map(|p| p.id.clone());
        }
        self.insert_returning(session, "/rest/v1/events", &event).await
    }

    pub async fn update_event(&self, session: &Session, id: Uuid, event: &Event) -> Result<()> {
        event.validate()?;
        let body = serde_json::to_value(event)?;
        self.send(
            Method::PATCH,
            &format!("/rest/v1/events?id=eq.{id}"),
            Some(&body),
            Some(session),
            &[("Prefer", "return=minimal")],
        )
        .await?;
        Ok(())
    }

    pub async fn delete_event(&self, session: &Session, id: Uuid) -> Result<()> {
        self.send(
            Method::DELETE,
            &format!("/rest/v1/events?id=eq.{id}"),
            None,
            Some(session),
            &[],
        )
        .await?;
        Ok(())
    }

    // --- announcements ---

    /// Newest first.
    pub async fn list_announcements(&self, session: Option<&Session>) -> Result<Vec<Announcement>> {
        let text = self
            .send(
                Method::GET,
                "/rest/v1/classroom_announcements?select=id,title,text,creator_name,creation_time,created_at&order=created_at.desc",
                None,
                session,
                &[],
            )
            .await?;
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn create_announcement(
        &self,
        session: &Session,
        announcement: &Announcement,
    ) -> Result<Announcement> {
        self.insert_returning(session, "/rest/v1/classroom_announcements", announcement)
            .await
    }

    pub async fn update_announcement(
        &self,
        session: &Session,
        id: Uuid,
        announcement: &Announcement,
    ) -> Result<()> {
        let body = serde_json::to_value(announcement)?;
        self.send(
            Method::PATCH,
            &format!("/rest/v1/classroom_announcements?id=eq.{id}"),
            Some(&body),
            Some(session),
            &[("Prefer", "return=minimal")],
        )
        .await?;
        Ok(())
    }

    pub async fn delete_announcement(&self, session: &Session, id: Uuid) -> Result<()> {
        self.send(
            Method::DELETE,
            &format!("/rest/v1/classroom_announcements?id=eq.{id}"),
            None,
            Some(session),
            &[],
        )
        .await?;
        Ok(())
    }

    // --- roles ---

    pub async fn list_role_assignments(&self, session: &Session) -> Result<Vec<RoleAssignment>> {
        self.get_rows(session, "/rest/v1/user_roles?select=user_id,role")
            .await
    }

    pub async fn grant_role(&self, session: &Session, user_id: &str, role: Role) -> Result<()> {
        let body = serde_json::to_value([RoleAssignment {
            user_id: user_id.to_string(),
            role,
        }])?;
        self.send(
            Method::POST,
            "/rest/v1/user_roles",
            Some(&body),
            Some(session),
            &[("Prefer", "return=minimal")],
        )
        .await?;
        info!(user_id, %role, "role granted");
        Ok(())
    }

    pub async fn revoke_role(&self, session: &Session, user_id: &str, role: Role) -> Result<()> {
        let endpoint = format!(
            "/rest/v1/user_roles?user_id=eq.{}&role=eq.{}",
            urlencoding::encode(user_id),
            role
        );
        self.send(Method::DELETE, &endpoint, None, Some(session), &[])
            .await?;
        info!(user_id, %role, "role revoked");
        Ok(())
    }

    // --- plumbing ---

    async fn get_rows<T: DeserializeOwned>(&self, session: &Session, endpoint: &str) -> Result<Vec<T>> {
        let text = self.send(Method::GET, endpoint, None, Some(session), &[]).await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn insert_returning<T>(&self, session: &Session, endpoint: &str, row: &T) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let body = serde_json::to_value([row])?;
        let text = self
            .send(
                Method::POST,
                endpoint,
                Some(&body),
                Some(session),
                &[("Prefer", "return=representation")],
            )
            .await?;
        let mut rows: Vec<T> = serde_json::from_str(&text)?;
        match rows.len() {
            1 => Ok(rows.remove(0)),
            count => Err(Error::MultipleRows {
                table: endpoint.to_string(),
                count,
            }),
        }
    }

    /// Fill in `expires_at`, persist, and hand back the session.
    fn accept_session(&self, mut session: Session) -> Result<Session> {
        if session.expires_at.is_none() {
            session.expires_at = session.expires_in.map(|secs| Utc::now().timestamp() + secs);
        }
        self.store.save(&session)?;
        Ok(session)
    }

    fn publish(&self, event: AuthEvent) {
        debug!(event = event.name(), "session change");
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Issue one call and return the response body. Non-2xx becomes `Error::Upstream`.
    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
        session: Option<&Session>,
        extra_headers: &[(&str, &str)],
    ) -> Result<String> {
        let response = match &self.transport {
            Transport::Direct { base_url, anon_key } => {
                let bearer = session
                    .map(Session::bearer)
                    .unwrap_or_else(|| format!("Bearer {anon_key}"));
                let mut request = self
                    .client
                    .request(method.clone(), format!("{base_url}{endpoint}"))
                    .header("apikey", anon_key)
                    .header("Authorization", bearer);
                for (name, value) in extra_headers {
                    request = request.header(*name, *value);
                }
                if let Some(body) = body {
                    request = request.json(body);
                }
                request.send().await?
            }
            Transport::Proxied { proxy_url } => {
                let mut headers: BTreeMap<&str, String> = extra_headers
                    .iter()
                    .map(|(name, value)| (*name, value.to_string()))
                    .collect();
                if let Some(session) = session {
                    headers.insert("Authorization", session.bearer());
                }
                let envelope = OutboundEnvelope {
                    endpoint,
                    method: method.as_str(),
                    body,
                    headers,
                };
                self.client.post(proxy_url).json(&envelope).send().await?
            }
        };

        let status = response.status();
        let text = response.text().await?;
        debug!(%method, endpoint, status = status.as_u16(), "data service call");
        if !status.is_success() {
            return Err(Error::upstream(status.as_u16(), text));
        }
        Ok(text)
    }
}

#[async_trait]
impl DataService for RestDataService {
    async fn current_session(&self) -> Result<Option<Session>> {
        let Some(session) = self.store.load()? else {
            return Ok(None);
        };
        if !session.is_expired_at(Utc::now()) {
            return Ok(Some(session));
        }
        if session.refresh_token.is_none() {
            info!("persisted session expired");
            self.store.clear()?;
            return Ok(None);
        }
        match self.refresh_session(&session).await {
            Ok(refreshed) => Ok(Some(refreshed)),
            Err(e) => {
                warn!("session refresh failed: {e}");
                self.store.clear()?;
                self.publish(AuthEvent::SignedOut);
                Ok(None)
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    async fn is_admin(&self, session: &Session) -> Result<bool> {
        self.rpc_bool(session, "is_admin", json!({})).await
    }

    async fn is_overseer(&self, session: &Session) -> Result<bool> {
        self.rpc_bool(session, "is_overseer", json!({})).await
    }

    async fn profile(&self, session: &Session, user_id: &str) -> Result<Option<Profile>> {
        let endpoint = format!(
            "/rest/v1/profiles?select=user_id,display_name&user_id=eq.{}",
            urlencoding::encode(user_id)
        );
        let mut rows: Vec<Profile> = self.get_rows(session, &endpoint).await?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            count => Err(Error::MultipleRows {
                table: "profiles".to_string(),
                count,
            }),
        }
    }
}
