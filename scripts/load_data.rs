//! Seed sample content into the club data service
//!
//! Signs in with an admin/overseer account and inserts a few events and
//! announcements so a fresh project has something to render.
//! Run: SEED_EMAIL=... SEED_PASSWORD=... cargo run --bin load_data

use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::Parser;
use tracing::{info, warn};

use club_edge::config::{load_dotenv, ClientConfig, LogConfig};
use club_edge::data_service::RestDataService;
use club_edge::gate::AuthGate;
use club_edge::logging;
use club_edge::models::{Announcement, Capability, Event};
use club_edge::storage::SessionStore;

#[derive(Parser)]
#[command(name = "load_data", about = "Seed sample events and announcements")]
struct Args {
    #[arg(long, env = "SEED_EMAIL")]
    email: String,

    #[arg(long, env = "SEED_PASSWORD", hide_env_values = true)]
    password: String,

    #[command(flatten)]
    client: ClientConfig,

    #[command(flatten)]
    logging: LogConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let args = Args::parse();
    let _log_guard = logging::init(&args.logging, "info");

    // Throwaway store: seeding must not replace the operator's saved session
    let service = Arc::new(RestDataService::new(
        args.client.transport()?,
        SessionStore::temporary()?,
    ));
    service.sign_in_with_password(&args.email, &args.password).await?;

    // started after sign-in so the initial check picks up the new session
    let gate = AuthGate::new(service.clone());
    let _handle = gate.start();
    let snapshot = gate.wait_resolved().await;
    snapshot.require(Capability::ManageContent)?;
    let session = snapshot
        .session
        .clone()
        .ok_or(club_edge::error::Error::NotSignedIn)?;

    let today = Utc::now().date_naive();
    let events = [
        ("Weekly Problem Session", 7, "15:30", "Room 204", "All members", Some("Bring a calculator.")),
        ("Contest Prep: Number Theory", 14, "15:30", "Library", "Competition team", None),
        ("Pi Day Social", 28, "12:00", "Cafeteria", "Everyone", Some("Pie provided.")),
    ];
    for (name, days_out, time, location, participants, description) in events {
        let event = Event {
            id: None,
            name: name.to_string(),
            description: description.map(str::to_string),
            date: today + Duration::days(days_out),
            time: time.to_string(),
            location: location.to_string(),
            participants: participants.to_string(),
            created_by: None,
        };
        match service.create_event(&session, &event).await {
            Ok(created) => info!(id = ?created.id, name, "event inserted"),
            Err(e) => warn!(name, "event not inserted: {e}"),
        }
    }

    let creator = snapshot
        .display_name
        .clone()
        .unwrap_or_else(|| "Admin".to_string());
    let announcements = [
        (Some("Welcome back"), "Meetings resume this Thursday after school."),
        (None, "Sign-ups for the regional contest close Friday."),
    ];
    for (title, text) in announcements {
        let announcement =
            Announcement::admin_created(title.map(str::to_string), text, creator.clone(), Utc::now())?;
        match service.create_announcement(&session, &announcement).await {
            Ok(created) => info!(id = ?created.id, "announcement inserted"),
            Err(e) => warn!("announcement not inserted: {e}"),
        }
        // announcement ids are millisecond-stamped
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    info!("seed complete");
    Ok(())
}
