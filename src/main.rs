use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edufund_session::config::Config;
use edufund_session::telemetry;
use edufund_session::{
    AuthView, HostSignal, InteractionKind, MemoryIdentityService, MemoryProfileStore,
    SessionController, SignUpRequest, UserType,
};

const DEMO_EMAIL: &str = "ada@edufund.test";
const DEMO_PASSWORD: &str = "correct-horse";
const AUTH_STORAGE_KEY: &str = "sb-edufund-auth-token";

#[derive(Parser, Debug)]
#[command(name = "edufund-session")]
#[command(author, version, about = "Walk through the EduFund session lifecycle against in-memory services", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "edufund-session.toml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print every state change as a JSON line on stdout
    #[arg(long)]
    json: bool,

    /// Use a one second focus threshold so the idle step finishes quickly
    #[arg(long, env = "EDUFUND_QUICK")]
    quick: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load(&cli.config)?;
    if cli.quick {
        config.session.focus_threshold_secs = 1;
    }

    // Initialize logging
    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting edufund-session v{}", env!("CARGO_PKG_VERSION"));
    telemetry::describe_metrics();

    let identity = Arc::new(MemoryIdentityService::new());
    let profiles = Arc::new(MemoryProfileStore::new());
    let controller =
        SessionController::start(identity.clone(), profiles, config.session.clone());

    let printer = tokio::spawn(print_views(controller.subscribe(), cli.json));

    let result = walkthrough(&controller, &identity, &config).await;

    controller.dispose();
    printer.abort();
    result?;

    info!("Walkthrough finished");
    Ok(())
}

async fn print_views(mut views: watch::Receiver<AuthView>, json: bool) {
    loop {
        let view = views.borrow_and_update().clone();
        if json {
            match serde_json::to_string(&view) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "Could not serialize auth state"),
            }
        } else {
            info!(
                phase = ?view.phase,
                user_id = view.user_id().unwrap_or("-"),
                has_profile = view.profile.is_some(),
                loading = view.is_loading,
                "Auth state changed"
            );
        }

        if views.changed().await.is_err() {
            break;
        }
    }
}

async fn walkthrough(
    controller: &SessionController,
    identity: &MemoryIdentityService,
    config: &Config,
) -> Result<()> {
    let view = controller.ready().await;
    info!(phase = ?view.phase, "Initial session check done");

    // Student sign-up creates the identity and the profile row
    let request = SignUpRequest {
        email: DEMO_EMAIL.to_string(),
        password: DEMO_PASSWORD.to_string(),
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
        user_type: UserType::Student,
        username: Some("ada_l".to_string()),
    };
    let user_id = controller
        .sign_up(&request)
        .await
        .context("Sign-up failed")?;
    info!(user_id = %user_id, "Student account created");

    // The session arrives through the provider's notification
    controller
        .sign_in(DEMO_EMAIL, DEMO_PASSWORD)
        .await
        .context("Sign-in failed")?;
    let mut views = controller.subscribe();
    let view = tokio::time::timeout(
        Duration::from_secs(10),
        views.wait_for(|view| view.is_authenticated && !view.is_loading),
    )
    .await
    .context("Timed out waiting for the profile")?
    .context("Controller stopped")?
    .clone();
    info!(
        name = view.display_name().unwrap_or_default(),
        "Signed in"
    );

    // Focus right after typing is gated; after idling it revalidates
    controller
        .handle_signal(HostSignal::Interaction {
            kind: InteractionKind::Key,
        })
        .await;
    let outcome = controller.handle_signal(HostSignal::Focus).await;
    info!(outcome = ?outcome, "Focus while active");

    let idle = config.session.focus_threshold();
    info!(idle_secs = idle.as_secs(), "Leaving the tab idle");
    tokio::time::sleep(idle).await;
    let outcome = controller.handle_signal(HostSignal::Focus).await;
    info!(outcome = ?outcome, "Focus after idling");

    // Another tab rotates the shared token
    if identity.store_session_silently(DEMO_EMAIL).is_none() {
        bail!("Demo account disappeared");
    }
    let outcome = controller
        .handle_signal(HostSignal::StorageChanged {
            key: AUTH_STORAGE_KEY.to_string(),
        })
        .await;
    info!(outcome = ?outcome, "Auth token changed in another tab");

    controller.sign_out().await;
    let view = controller.snapshot();
    info!(phase = ?view.phase, "Signed out");

    Ok(())
}
