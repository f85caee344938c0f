mod utils;

pub mod attendance;
pub mod clock;
pub mod commands;
pub mod connection;
pub mod controller;
pub mod db;
pub mod error;
pub mod models;
pub mod punch;
pub mod settings;

use std::{fs, sync::Arc};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use attendance::WindowTracker;
use clock::{SharedClock, SystemClock};
use commands::{Command, Reply};
use connection::Credentials;
use controller::{ControllerOptions, NoticeLevel, PresenceController};
use db::LocalStore;
use punch::{FixedLocation, PunchBook, PunchCoordinator};
use settings::SettingsStore;

fn init_logging() {
    let level = if settings::debug_enabled() {
        "debug"
    } else {
        "info"
    };
    // RUST_LOG still wins when set.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

pub fn run() -> Result<()> {
    init_logging();
    log::info!("Rollcall starting up...");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build the async runtime")?;
    runtime.block_on(serve())
}

async fn serve() -> Result<()> {
    let data_dir = settings::data_dir()?;
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;

    let settings_store = SettingsStore::new(data_dir.join("settings.json"))?;
    let settings = settings_store.effective();
    log::info!(
        "Signed in as {} against {}",
        settings.role.as_str(),
        settings.server_url
    );

    let store = LocalStore::open(data_dir.join("rollcall.sqlite3"))?;
    let credentials = Credentials {
        token: settings::auth_token(),
    };
    let connection = connection::open(
        &settings.server_url,
        &credentials,
        settings.reconnect_max_backoff(),
    )
    .await?;

    let clock: SharedClock = Arc::new(SystemClock);
    let book = PunchBook::new(store.clone());
    let tracker = WindowTracker::new(store, book.clone(), connection.clone(), clock.clone());
    let coordinator = PunchCoordinator::new(
        book,
        tracker.clone(),
        connection.clone(),
        Arc::new(FixedLocation::new(settings.location)),
        clock,
        settings.role,
        settings.lock_timeout(),
    );
    let controller = PresenceController::new(
        connection.clone(),
        tracker,
        coordinator,
        ControllerOptions {
            role: settings.role,
            tick_interval: settings.tick_interval(),
            default_duration_minutes: settings.default_duration_minutes,
        },
    );

    controller.restore().await;
    controller.start().await;

    let mut notices = controller.subscribe_notices();
    let printer = tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            let scope = notice.classroom_id.as_deref().unwrap_or("-");
            match notice.level {
                NoticeLevel::Info => println!("[{scope}] {}", notice.message),
                NoticeLevel::Error => eprintln!("[{scope}] error: {}", notice.message),
            }
        }
    });

    println!("{}", commands::HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line.context("Failed to read from stdin")?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(err) => {
                eprintln!("{err}");
                continue;
            }
        };
        match commands::execute(&controller, command).await {
            Ok(Reply::Text(text)) => println!("{text}"),
            Ok(Reply::Quit) => break,
            Err(err) => eprintln!("error: {err}"),
        }
    }

    log::info!("Rollcall shutting down");
    controller.shutdown().await;
    connection.close();
    printer.abort();
    Ok(())
}
