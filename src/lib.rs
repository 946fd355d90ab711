pub mod config;
pub mod geolocation;
pub mod languages;
pub mod network;
pub mod resolver;
pub mod step;
pub mod timezones;
pub mod welcome;
