use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nebula_timezone::config::load_config;
use nebula_timezone::languages::{load_languages, locale_from_lang, CurrentLanguage};
use nebula_timezone::resolver::GeoResolver;
use nebula_timezone::step::TimezoneStep;
use nebula_timezone::timezones::{detect_timezone_local, TimezoneDb};
use nebula_timezone::welcome::{Welcome, WelcomeAction, WelcomeChoice};

fn env_flag(name: &str) -> bool {
    std::env::var(name).ok().as_deref() == Some("1")
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_env("NEBULA_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config()?;

    // Strip .UTF-8 from the locale; read once here and passed down
    let locale = std::env::var("LANG")
        .map(|lang| locale_from_lang(&lang))
        .unwrap_or_else(|_| "C".to_string());
    info!(locale = %locale, "starting nebula-timezone");

    let choice: WelcomeChoice = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => WelcomeChoice::Graphical,
    };

    // Geolocation only starts once the graphical install is chosen
    let offline = env_flag("NEBULA_SKIP_NETWORK") || env_flag("NEBULA_OFFLINE_ONLY");
    let welcome = Welcome::new(&config.welcome);
    let resolver = match welcome.on_choice(choice, || {
        if offline {
            info!("geolocation skipped (offline)");
            None
        } else {
            Some(GeoResolver::start_from_config(&config))
        }
    }) {
        WelcomeAction::Quit => return Ok(()),
        WelcomeAction::Ignored => anyhow::bail!("{choice:?} is disabled on this system"),
        WelcomeAction::Error(message) => anyhow::bail!(message),
        WelcomeAction::Advance { resolver, next } => {
            info!(next, "leaving welcome step");
            resolver
        }
    };

    match load_languages(&config.languages, CurrentLanguage::Locale(&locale)) {
        Ok(languages) => info!(
            current = %languages.current,
            available = languages.choices.len(),
            "language list loaded"
        ),
        Err(err) => warn!("can't load language list: {err:#}"),
    }

    let db = TimezoneDb::load(&config.timezones).context("load timezones")?;
    let mut step = TimezoneStep::new(db, resolver, config.geolocation.result_timeout());
    if !step.prepare() {
        let names = step.db().names();
        if let Some(timezone) = detect_timezone_local(&names, Path::new("/")) {
            info!(timezone = %timezone, "using configured system timezone");
            step.set_timezone(&timezone);
        }
    }
    step.stop();

    let settings = step.store_values();
    let rendered = toml::to_string(&settings).context("render timezone settings")?;
    print!("{rendered}");
    Ok(())
}
