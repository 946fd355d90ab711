/////////
/// Timezone database: zone.tab locations, listing and lookup.
////////
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use anyhow::Result;
use tracing::debug;

use crate::config::TimezonesConfig;
use crate::geolocation::Coordinates;

const EARTH_RADIUS_KM: f64 = 6371.0;
const UTC_VARIANTS: [&str; 4] = ["UTC", "Etc/UTC", "Etc/GMT", "GMT"];

// A single zone.tab entry
#[derive(Clone, Debug, PartialEq)]
pub struct Location {
    pub country: String,        // ISO 3166 code
    pub human_country: String,  // Country name, or the code if unknown
    pub zone: String,           // e.g. "America/New_York"
    pub human_zone: String,     // e.g. "New York"
    pub latitude: f64,
    pub longitude: f64,
    pub comment: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct TimezoneDb {
    locations: Vec<Location>,
}

impl TimezoneDb {
    /// Loads the first usable zone table listed in the configuration.
    pub fn load(config: &TimezonesConfig) -> Result<Self> {
        let countries = match &config.iso3166_tab {
            Some(path) => fs::read_to_string(path)
                .map(|content| parse_iso3166(&content))
                .unwrap_or_else(|err| {
                    debug!("can't read {}: {err}", path.display());
                    HashMap::new()
                }),
            None => HashMap::new(),
        };

        for path in &config.zone_tab {
            let content = match fs::read_to_string(path) {
                Ok(content) => content,
                Err(err) => {
                    debug!("can't read {}: {err}", path.display());
                    continue;
                }
            };
            let db = Self::from_tab(&content, &countries);
            if !db.locations.is_empty() {
                debug!(
                    path = %path.display(),
                    locations = db.locations.len(),
                    "loaded timezone table"
                );
                return Ok(db);
            }
        }

        Err(anyhow::anyhow!("No timezone list found"))
    }

    /// Parses zone.tab / zone1970.tab contents.
    pub fn from_tab(content: &str, countries: &HashMap<String, String>) -> Self {
        let mut locations: Vec<Location> = content
            .lines()
            .filter_map(|line| parse_zone_line(line, countries))
            .collect();
        locations.sort_by(|a, b| a.zone.cmp(&b.zone));
        locations.dedup_by(|a, b| a.zone == b.zone);
        Self { locations }
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    // Sorted timezone names, always including a UTC entry
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.locations.iter().map(|loc| loc.zone.clone()).collect();
        if !names.iter().any(|zone| is_utc_variant(zone)) {
            names.push("UTC".to_string());
            names.sort();
        }
        names
    }

    // First path segments ("America", "Europe", ...)
    pub fn zones(&self) -> Vec<String> {
        let zones: BTreeSet<&str> = self
            .locations
            .iter()
            .filter_map(|loc| loc.zone.split_once('/').map(|(zone, _)| zone))
            .collect();
        zones.into_iter().map(str::to_string).collect()
    }

    // Everything after the first segment, for one zone
    pub fn regions(&self, zone: &str) -> Vec<String> {
        let mut regions: Vec<String> = self
            .locations
            .iter()
            .filter_map(|loc| loc.zone.split_once('/'))
            .filter(|(z, _)| *z == zone)
            .map(|(_, region)| region.to_string())
            .collect();
        regions.sort();
        regions
    }

    pub fn get_loc(&self, zone: &str) -> Option<&Location> {
        self.locations.iter().find(|loc| loc.zone == zone)
    }

    /// Location closest to `coords` along the great circle.
    pub fn nearest(&self, coords: Coordinates) -> Option<&Location> {
        self.locations.iter().min_by(|a, b| {
            let da = distance_km(coords, a.latitude, a.longitude);
            let db = distance_km(coords, b.latitude, b.longitude);
            da.total_cmp(&db)
        })
    }
}

fn parse_zone_line(line: &str, countries: &HashMap<String, String>) -> Option<Location> {
    let line = line.trim_end();
    // Skip empty lines and comments.
    if line.trim().is_empty() || line.starts_with('#') {
        return None;
    }
    let mut parts = line.split('\t');
    // zone1970.tab lists several countries per zone; the first one wins
    let country = parts.next()?.split(',').next()?.trim().to_string();
    let (latitude, longitude) = parse_iso6709(parts.next()?.trim())?;
    let zone = parts.next()?.trim().to_string();
    if zone.is_empty() {
        return None;
    }
    let comment = parts
        .next()
        .map(str::trim)
        .filter(|comment| !comment.is_empty())
        .map(str::to_string);
    let human_country = countries
        .get(&country)
        .cloned()
        .unwrap_or_else(|| country.clone());
    Some(Location {
        human_zone: human_zone(&zone),
        country,
        human_country,
        zone,
        latitude,
        longitude,
        comment,
    })
}

fn human_zone(zone: &str) -> String {
    zone.rsplit('/').next().unwrap_or(zone).replace('_', " ")
}

// "+4043-07400" or "+404251-0740023" to decimal degrees
fn parse_iso6709(value: &str) -> Option<(f64, f64)> {
    let split = value
        .char_indices()
        .skip(1)
        .find(|(_, c)| *c == '+' || *c == '-')
        .map(|(idx, _)| idx)?;
    let (lat, lon) = value.split_at(split);
    let latitude = parse_dms(lat, 2)?;
    let longitude = parse_dms(lon, 3)?;
    Coordinates::new(latitude, longitude).map(|c| (c.latitude, c.longitude))
}

fn parse_dms(value: &str, degree_digits: usize) -> Option<f64> {
    let (sign, digits) = if let Some(digits) = value.strip_prefix('+') {
        (1.0, digits)
    } else {
        (-1.0, value.strip_prefix('-')?)
    };
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let field = |from: usize, len: usize| -> Option<f64> {
        digits.get(from..from + len)?.parse::<f64>().ok()
    };
    let degrees = field(0, degree_digits)?;
    let minutes = field(degree_digits, 2)?;
    let seconds = match digits.len() - degree_digits {
        2 => 0.0,
        4 => field(degree_digits + 2, 2)?,
        _ => return None,
    };
    Some(sign * (degrees + minutes / 60.0 + seconds / 3600.0))
}

// iso3166.tab: "CC<TAB>Country name"
fn parse_iso3166(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('\t'))
        .map(|(code, name)| (code.trim().to_string(), name.trim().to_string()))
        .filter(|(code, name)| !code.is_empty() && !name.is_empty())
        .collect()
}

fn distance_km(from: Coordinates, latitude: f64, longitude: f64) -> f64 {
    let (lat1, lat2) = (from.latitude.to_radians(), latitude.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (longitude - from.longitude).to_radians();
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}

// Checks if a given timezone string represents a UTC variant.
pub fn is_utc_variant(tz: &str) -> bool {
    UTC_VARIANTS.contains(&tz)
}

// Maps `tz` onto an entry of `names`, falling back to a UTC alias
pub fn normalize_timezone(names: &[String], tz: &str) -> Option<String> {
    if names.iter().any(|zone| zone == tz) {
        return Some(tz.to_string());
    }
    if !is_utc_variant(tz) {
        return None;
    }
    UTC_VARIANTS
        .iter()
        .find(|candidate| names.iter().any(|zone| zone == *candidate))
        .map(|candidate| candidate.to_string())
}

/// Reads the timezone already configured under `root` (`/etc/timezone`, then
/// the `/etc/localtime` symlink). UTC answers are ignored.
pub fn detect_timezone_local(names: &[String], root: &Path) -> Option<String> {
    let etc_timezone = root.join("etc/timezone");
    if let Ok(content) = fs::read_to_string(&etc_timezone) {
        if let Some(line) = content
            .lines()
            .map(|line| line.trim())
            .find(|line| !line.is_empty())
        {
            debug!("detect_timezone: /etc/timezone line={}", line);
            if let Some(value) = accept_local(names, line) {
                return Some(value);
            }
        }
    }

    // Direct link target first, then the fully resolved path for chained links
    let localtime = root.join("etc/localtime");
    let targets = [
        fs::read_link(&localtime).ok(),
        fs::canonicalize(&localtime).ok(),
    ];
    let mut found = false;
    for target in targets.into_iter().flatten() {
        found = true;
        let target = target.to_string_lossy();
        if let Some(tz) = target.split("zoneinfo/").nth(1) {
            debug!("detect_timezone: /etc/localtime -> {}", tz);
            return accept_local(names, tz);
        }
    }
    if !found {
        debug!("detect_timezone: /etc/localtime not found");
    }
    None
}

fn accept_local(names: &[String], tz: &str) -> Option<String> {
    let value = normalize_timezone(names, tz)?;
    if is_utc_variant(&value) {
        debug!("detect_timezone: {} is UTC, deferring", value);
        return None;
    }
    Some(value)
}
