use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::geolocation::Coordinates;
use crate::resolver::GeoResolver;
use crate::timezones::{Location, TimezoneDb};

// What the timezone step hands to the rest of the installer
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TimezoneSettings {
    pub human_zone: String,
    pub country: String,
    pub zone: String,
    pub human_country: String,
    pub comment: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    // Lets the installer thread know this step has been completed
    pub done: bool,
}

impl TimezoneSettings {
    fn from_location(loc: &Location) -> Self {
        Self {
            human_zone: loc.human_zone.clone(),
            country: loc.country.clone(),
            zone: loc.zone.clone(),
            human_country: loc.human_country.clone(),
            comment: loc.comment.clone().unwrap_or_default(),
            latitude: Some(loc.latitude),
            longitude: Some(loc.longitude),
            done: true,
        }
    }
}

/// "Where are you?" step. Consumes the resolver's answer when shown and
/// otherwise falls back to manual zone/region selection.
pub struct TimezoneStep {
    db: TimezoneDb,
    resolver: Option<GeoResolver>,
    result_timeout: Duration,
    autodetected: Option<Coordinates>,
    timezone: Option<String>,
}

impl TimezoneStep {
    pub fn new(db: TimezoneDb, resolver: Option<GeoResolver>, result_timeout: Duration) -> Self {
        Self {
            db,
            resolver,
            result_timeout,
            autodetected: None,
            timezone: None,
        }
    }

    pub fn db(&self) -> &TimezoneDb {
        &self.db
    }

    /// Called each time the step is shown. Returns whether the forward
    /// button should be enabled.
    pub fn prepare(&mut self) -> bool {
        self.timezone = None;
        if self.autodetected.is_none() {
            if let Some(resolver) = self.resolver.as_mut() {
                self.autodetected = resolver.try_take_result(self.result_timeout);
            }
            if self.autodetected.is_none() {
                debug!("can't autodetect timezone coordinates");
            }
        }

        if let Some(coords) = self.autodetected {
            if let Some(zone) = self.db.nearest(coords).map(|loc| loc.zone.clone()) {
                info!(%coords, zone = %zone, "timezone autodetected");
                self.set_timezone(&zone);
            }
        }
        self.forward_enabled()
    }

    pub fn autodetected(&self) -> Option<Coordinates> {
        self.autodetected
    }

    pub fn timezone(&self) -> Option<&str> {
        self.timezone.as_deref()
    }

    pub fn forward_enabled(&self) -> bool {
        self.timezone.is_some()
    }

    /// Selects a timezone by name; unknown names clear the selection.
    pub fn set_timezone(&mut self, timezone: &str) -> bool {
        if self.db.get_loc(timezone).is_some() {
            debug!("location changed to : {}", timezone);
            self.timezone = Some(timezone.to_string());
        } else {
            self.timezone = None;
        }
        self.forward_enabled()
    }

    // Zone and region combo boxes joined back together
    pub fn select(&mut self, zone: &str, region: &str) -> bool {
        self.set_timezone(&format!("{zone}/{region}"))
    }

    /// Zone and region of the current selection, for pre-filling the pickers.
    pub fn selected_zone_region(&self) -> Option<(&str, &str)> {
        self.timezone.as_deref()?.split_once('/')
    }

    pub fn store_values(&self) -> TimezoneSettings {
        match self
            .timezone
            .as_deref()
            .and_then(|zone| self.db.get_loc(zone))
        {
            Some(loc) => TimezoneSettings::from_location(loc),
            None => TimezoneSettings {
                done: true,
                ..TimezoneSettings::default()
            },
        }
    }

    pub fn stop(&mut self) {
        if let Some(resolver) = self.resolver.as_mut() {
            resolver.stop();
        }
    }
}
