/////////
/// Welcome step: try the live system, switch to the CLI installer, or go on
/// with the graphical installer.
////////
use std::process::Command;
use std::str::FromStr;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::config::WelcomeConfig;
use crate::resolver::GeoResolver;

pub const NEXT_STEP: &str = "language";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WelcomeChoice {
    TryIt,     // Leave the installer and keep using the live system
    Cli,       // Hand over to the text-mode installer
    Graphical, // Continue here
}

impl FromStr for WelcomeChoice {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tryit" | "try-it" => Ok(WelcomeChoice::TryIt),
            "cli" => Ok(WelcomeChoice::Cli),
            "graphical" | "graph" => Ok(WelcomeChoice::Graphical),
            other => anyhow::bail!("unknown welcome choice {:?}", other),
        }
    }
}

// What the installer does after a welcome button was pressed
pub enum WelcomeAction {
    Quit,
    // Choice not available (Try It disabled); stay on the welcome step
    Ignored,
    // Launching the CLI installer failed; show the message and stay
    Error(String),
    // Geolocation is running (unless offline); move on to `next`
    Advance {
        resolver: Option<GeoResolver>,
        next: &'static str,
    },
}

pub struct Welcome {
    disable_tryit: bool,
    cli_installer: Vec<String>,
}

impl Welcome {
    pub fn new(config: &WelcomeConfig) -> Self {
        Self {
            disable_tryit: config.disable_tryit,
            cli_installer: config.cli_installer.clone(),
        }
    }

    pub fn is_enabled(&self, choice: WelcomeChoice) -> bool {
        !(choice == WelcomeChoice::TryIt && self.disable_tryit)
    }

    /// Handles a choice. The resolver is only started once the user commits
    /// to the graphical install.
    pub fn on_choice<F>(&self, choice: WelcomeChoice, start_resolver: F) -> WelcomeAction
    where
        F: FnOnce() -> Option<GeoResolver>,
    {
        if !self.is_enabled(choice) {
            info!(?choice, "welcome choice disabled");
            return WelcomeAction::Ignored;
        }
        match choice {
            WelcomeChoice::TryIt => WelcomeAction::Quit,
            WelcomeChoice::Cli => match self.launch_cli() {
                Ok(()) => WelcomeAction::Quit,
                Err(err) => {
                    let message = format!("{err:#}");
                    error!("{}", message);
                    WelcomeAction::Error(message)
                }
            },
            WelcomeChoice::Graphical => WelcomeAction::Advance {
                resolver: start_resolver(),
                next: NEXT_STEP,
            },
        }
    }

    // Spawned, not waited on: the CLI installer outlives this process
    fn launch_cli(&self) -> Result<()> {
        let Some((program, args)) = self.cli_installer.split_first() else {
            anyhow::bail!("no CLI installer configured");
        };
        let child = Command::new(program)
            .args(args)
            .spawn()
            .with_context(|| format!("launch {}", self.cli_installer.join(" ")))?;
        info!(pid = child.id(), "started CLI installer {}", program);
        Ok(())
    }
}
