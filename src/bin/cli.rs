use std::sync::Arc;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use club_edge::config::{load_dotenv, ClientConfig, LogConfig};
use club_edge::data_service::{DataService, RestDataService, SignUpOutcome};
use club_edge::gate::{AuthGate, CapabilitySnapshot};
use club_edge::logging;
use club_edge::models::{user_directory, Announcement, Capability, Event, Role, Session};
use club_edge::storage::SessionStore;

#[derive(Parser)]
#[command(name = "club-cli")]
#[command(about = "Sessions, content and roles for the club data service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    client: ClientConfig,

    #[command(flatten)]
    logging: LogConfig,
}

#[derive(Subcommand)]
enum Commands {
    Login {
        #[arg(short, long, required_unless_present = "token")]
        email: Option<String>,
        #[arg(short, long, required_unless_present = "token")]
        password: Option<String>,
        /// Adopt an access token instead of signing in with a password
        #[arg(long, conflicts_with_all = ["email", "password"])]
        token: Option<String>,
    },
    Signup {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
        #[arg(short = 'n', long)]
        display_name: Option<String>,
    },
    Logout,
    /// Resolve and print the current capability snapshot
    Whoami,
    Events {
        #[command(subcommand)]
        action: EventAction,
    },
    Announcements {
        #[command(subcommand)]
        action: AnnouncementAction,
    },
    Roles {
        #[command(subcommand)]
        action: RoleAction,
    },
}

#[derive(clap::Args)]
struct EventFields {
    #[arg(short, long)]
    name: String,
    #[arg(short, long)]
    date: NaiveDate,
    #[arg(short, long)]
    time: String,
    #[arg(short, long)]
    location: String,
    #[arg(short = 'P', long)]
    participants: String,
    #[arg(short = 'D', long)]
    description: Option<String>,
}

impl EventFields {
    fn into_event(self) -> Event {
        Event {
            id: None,
            name: self.name.trim().to_string(),
            description: self
                .description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
            date: self.date,
            time: self.time,
            location: self.location.trim().to_string(),
            participants: self.participants.trim().to_string(),
            created_by: None,
        }
    }
}

#[derive(Subcommand)]
enum EventAction {
    List,
    Create(EventFields),
    Update {
        #[arg(long)]
        id: Uuid,
        #[command(flatten)]
        fields: EventFields,
    },
    Delete {
        #[arg(long)]
        id: Uuid,
    },
}

#[derive(clap::Args)]
struct AnnouncementFields {
    #[arg(short, long)]
    title: Option<String>,
    #[arg(short = 'x', long)]
    text: String,
    /// Used when the profile has no display name
    #[arg(short, long)]
    creator: Option<String>,
}

impl AnnouncementFields {
    /// Edits rewrite the whole row, creator and timestamp included.
    fn into_announcement(self, snapshot: &CapabilitySnapshot) -> anyhow::Result<Announcement> {
        let creator_name = snapshot
            .display_name
            .clone()
            .or(self.creator.map(|c| c.trim().to_string()).filter(|c| !c.is_empty()))
            .or(snapshot.principal.as_ref().and_then(|p| p.email.clone()))
            .unwrap_or_else(|| "Admin".to_string());
        Ok(Announcement::admin_created(self.title, &self.text, creator_name, Utc::now())?)
    }
}

#[derive(Subcommand)]
enum AnnouncementAction {
    List,
    Create(AnnouncementFields),
    Update {
        #[arg(long)]
        id: Uuid,
        #[command(flatten)]
        fields: AnnouncementFields,
    },
    Delete {
        #[arg(long)]
        id: Uuid,
    },
}

#[derive(Subcommand)]
enum RoleAction {
    List,
    Grant {
        #[arg(short, long)]
        user_id: String,
        #[arg(short, long)]
        role: Role,
    },
    Revoke {
        #[arg(short, long)]
        user_id: String,
        #[arg(short, long)]
        role: Role,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let cli = Cli::parse();
    let _log_guard = logging::init(&cli.logging, "warn");

    let store = SessionStore::open(&cli.client.session_store)
        .with_context(|| format!("opening session store {}", cli.client.session_store))?;
    let service = Arc::new(
        RestDataService::new(cli.client.transport()?, store)
            .with_jwt_secret(cli.client.jwt_secret()),
    );

    match cli.command {
        Commands::Login {
            email,
            password,
            token,
        } => {
            let session = match (token, email, password) {
                (Some(token), _, _) => service.sign_in_with_token(&token).await?,
                (None, Some(email), Some(password)) => {
                    service.sign_in_with_password(&email, &password).await?
                }
                _ => anyhow::bail!("either --token or --email and --password are required"),
            };
            let who = session
                .principal()
                .and_then(|p| p.email.clone().or(Some(p.id.clone())))
                .unwrap_or_default();
            println!("Logged in as {who}. Session saved to {}", cli.client.session_store);
        }
        Commands::Signup {
            email,
            password,
            display_name,
        } => match service
            .sign_up(&email, &password, display_name.as_deref())
            .await?
        {
            SignUpOutcome::SignedIn(_) => println!("Signed up and logged in as {email}."),
            SignUpOutcome::ConfirmationPending(_) => {
                println!("Signed up. Confirm the email sent to {email} before logging in.")
            }
        },
        Commands::Logout => {
            service.sign_out().await?;
            println!("Logged out (session removed).");
        }
        Commands::Whoami => {
            let snapshot = resolve(&service).await;
            print_json(&WhoAmI::from(&snapshot))?;
        }
        Commands::Events { action } => events(&service, action).await?,
        Commands::Announcements { action } => announcements(&service, action).await?,
        Commands::Roles { action } => roles(&service, action).await?,
    }

    Ok(())
}

/// Start a gate over the stored session and wait for its answer.
async fn resolve(service: &Arc<RestDataService>) -> CapabilitySnapshot {
    let gate = AuthGate::new(service.clone());
    let _handle = gate.start();
    gate.wait_resolved().await
}

/// Resolve capabilities and fail unless `capability` is granted.
async fn authorize(service: &Arc<RestDataService>, capability: Capability) -> anyhow::Result<(Session, CapabilitySnapshot)> {
    let snapshot = resolve(service).await;
    snapshot.require(capability)?;
    let session = snapshot
        .session
        .clone()
        .ok_or(club_edge::error::Error::NotSignedIn)?;
    Ok((session, snapshot))
}

async fn events(service: &Arc<RestDataService>, action: EventAction) -> anyhow::Result<()> {
    match action {
        EventAction::List => {
            let session = service.current_session().await?;
            print_json(&service.list_events(session.as_ref()).await?)?;
        }
        EventAction::Create(fields) => {
            let (session, _) = authorize(service, Capability::ManageContent).await?;
            let created = service.create_event(&session, &fields.into_event()).await?;
            print_json(&created)?;
        }
        EventAction::Update { id, fields } => {
            let (session, _) = authorize(service, Capability::ManageContent).await?;
            let mut event = fields.into_event();
            event.created_by = session.principal().map(|p| p.id.clone());
            service.update_event(&session, id, &event).await?;
            println!("Event {id} updated.");
        }
        EventAction::Delete { id } => {
            let (session, _) = authorize(service, Capability::ManageContent).await?;
            service.delete_event(&session, id).await?;
            println!("Event {id} deleted.");
        }
    }
    Ok(())
}

async fn announcements(service: &Arc<RestDataService>, action: AnnouncementAction) -> anyhow::Result<()> {
    match action {
        AnnouncementAction::List => {
            let session = service.current_session().await?;
            print_json(&service.list_announcements(session.as_ref()).await?)?;
        }
        AnnouncementAction::Create(fields) => {
            let (session, snapshot) = authorize(service, Capability::ManageContent).await?;
            let announcement = fields.into_announcement(&snapshot)?;
            print_json(&service.create_announcement(&session, &announcement).await?)?;
        }
        AnnouncementAction::Update { id, fields } => {
            let (session, snapshot) = authorize(service, Capability::ManageContent).await?;
            let announcement = fields.into_announcement(&snapshot)?;
            service.update_announcement(&session, id, &announcement).await?;
            println!("Announcement {id} updated.");
        }
        AnnouncementAction::Delete { id } => {
            let (session, _) = authorize(service, Capability::ManageContent).await?;
            service.delete_announcement(&session, id).await?;
            println!("Announcement {id} deleted.");
        }
    }
    Ok(())
}

async fn roles(service: &Arc<RestDataService>, action: RoleAction) -> anyhow::Result<()> {
    match action {
        RoleAction::List => {
            // viewing is open to the admin panel; changing roles is overseer-only
            let (session, _) = authorize(service, Capability::AdminPanel).await?;
            let profiles = service.list_profiles(&session).await?;
            let assignments = service.list_role_assignments(&session).await?;
            print_json(&user_directory(&profiles, &assignments))?;
        }
        RoleAction::Grant { user_id, role } => {
            let (session, _) = authorize(service, Capability::ManageRoles).await?;
            if service.has_role(&session, &user_id, role).await? {
                println!("{user_id} already has role {role}.");
            } else {
                service.grant_role(&session, &user_id, role).await?;
                println!("Granted {role} to {user_id}.");
            }
        }
        RoleAction::Revoke { user_id, role } => {
            let (session, _) = authorize(service, Capability::ManageRoles).await?;
            service.revoke_role(&session, &user_id, role).await?;
            println!("Revoked {role} from {user_id}.");
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct WhoAmI<'a> {
    signed_in: bool,
    user_id: Option<&'a str>,
    email: Option<&'a str>,
    display_name: Option<&'a str>,
    is_admin: bool,
    is_overseer: bool,
    admin_panel: bool,
}

impl<'a> From<&'a CapabilitySnapshot> for WhoAmI<'a> {
    fn from(s: &'a CapabilitySnapshot) -> Self {
        Self {
            signed_in: s.is_signed_in(),
            user_id: s.principal.as_ref().map(|p| p.id.as_str()),
            email: s.principal.as_ref().and_then(|p| p.email.as_deref()),
            display_name: s.display_name.as_deref(),
            is_admin: s.is_admin,
            is_overseer: s.is_overseer,
            admin_panel: s.can_access_admin_panel(),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
