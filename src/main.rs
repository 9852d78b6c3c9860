use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use ticketsync_lib::settings::SettingsStore;
use ticketsync_lib::types::SessionSignal;
use ticketsync_lib::view::ViewScope;
use ticketsync_lib::App;

const USERNAME_ENV: &str = "TICKETSYNC_USERNAME";
const PASSWORD_ENV: &str = "TICKETSYNC_PASSWORD";
const WATCH_TICKET_ENV: &str = "TICKETSYNC_WATCH_TICKET";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).init();

    let settings = SettingsStore::load().context("loading settings")?;
    let app = App::new(settings).context("building http client")?;
    let mut signals = app.bus().subscribe();

    let outcome = app.start().await;
    info!(?outcome, "ticketsync started");

    if !app.store().is_present() {
        let username = std::env::var(USERNAME_ENV).ok();
        let password = std::env::var(PASSWORD_ENV).ok();
        match (username, password) {
            (Some(username), Some(password)) => {
                let identity = app
                    .login(&username, &password)
                    .await
                    .context("signing in")?;
                info!(user_id = identity.id, role = identity.role.as_str(), "signed in");
            }
            _ => anyhow::bail!("no stored session; set {USERNAME_ENV} and {PASSWORD_ENV}"),
        }
    }

    let _revisions = app.hub().subscribe_global(|revision, event| {
        info!(revision, ticket_id = event.ticket_id, "notifications changed");
    });

    let mut view = ViewScope::new();
    if let Ok(raw) = std::env::var(WATCH_TICKET_ENV) {
        let ticket_id: i64 = raw
            .trim()
            .parse()
            .with_context(|| format!("{WATCH_TICKET_ENV} must be a ticket id"))?;
        view.watch_ticket(app.hub(), ticket_id, move |event| {
            info!(
                ticket_id,
                message = event.message.as_deref().unwrap_or(""),
                "watched ticket updated"
            );
        });
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; shutting down");
                break;
            }
            signal = signals.recv() => match signal {
                Ok(SessionSignal::Expired) => {
                    warn!("session expired; sign in again");
                    break;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    view.close();
    app.shutdown().await;
    Ok(())
}
