/////////
/// Language list shown on the language step.
////////
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::bufread::GzDecoder;
use tracing::debug;

use crate::config::LanguagesConfig;

const DEFAULT_LANGUAGE: &str = "English";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

// Display name -> (English name, locale code)
pub type DisplayMap = HashMap<String, (String, String)>;

#[derive(Clone, Debug, PartialEq)]
pub struct LanguageList {
    pub current: String,      // Translated name of the current language
    pub choices: Vec<String>, // Translated names, sorted for display
    pub display: DisplayMap,
}

impl LanguageList {
    pub fn code_of(&self, choice: &str) -> Option<&str> {
        self.display.get(choice).map(|(_, code)| code.as_str())
    }
}

// How the language selected on entry is picked
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CurrentLanguage<'a> {
    Default,
    // Line number in the list, skipped lines included
    Index(usize),
    // "de_DE": exact code first, then the "de" prefix
    Locale(&'a str),
}

/// Loads `index:code:name:translation` lines from a plain or gzipped file.
pub fn load_languages(
    config: &LanguagesConfig,
    current: CurrentLanguage<'_>,
) -> Result<LanguageList> {
    let path = config.list.as_path();
    let reader = open_list(path)?;
    parse_languages(reader, &config.skip_codes, current)
        .with_context(|| format!("parse {}", path.display()))
}

fn open_list(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let is_gzip = reader
        .fill_buf()
        .with_context(|| format!("read {}", path.display()))?
        .starts_with(&GZIP_MAGIC);
    if is_gzip {
        debug!("reading gzipped language list {}", path.display());
        Ok(Box::new(BufReader::new(GzDecoder::new(reader))))
    } else {
        Ok(Box::new(reader))
    }
}

pub fn parse_languages<R: BufRead>(
    reader: R,
    skip_codes: &[String],
    current_language: CurrentLanguage<'_>,
) -> Result<LanguageList> {
    let mut display = DisplayMap::new();
    let mut current = DEFAULT_LANGUAGE.to_string();
    let mut index = 0usize;
    let current_index = match current_language {
        CurrentLanguage::Index(line) => Some(line),
        _ => None,
    };

    for line in reader.lines() {
        let line = line.context("read language list")?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        let [_, code, name, trans] = fields[..] else {
            anyhow::bail!("malformed language line {:?}", line);
        };
        if skip_codes.iter().any(|skip| skip == code) {
            index += 1;
            continue;
        }
        // U+FEFF doesn't survive some toolkits; nobody needs the NBSP anyway
        let trans = trans.trim_matches(|c: char| c == ' ' || c == '\u{feff}').to_string();
        if current_index == Some(index) {
            current = trans.clone();
        }
        display.insert(trans, (name.to_string(), code.to_string()));
        index += 1;
    }

    if let CurrentLanguage::Locale(locale) = current_language {
        if let Some(trans) = match_locale(&display, locale) {
            current = trans;
        }
    }

    let mut choices: Vec<String> = display.keys().cloned().collect();
    // "C" first, then by code point
    choices.sort_by(|a, b| {
        let a_is_c = display[a].1 == "C";
        let b_is_c = display[b].1 == "C";
        b_is_c.cmp(&a_is_c).then_with(|| a.cmp(b))
    });

    Ok(LanguageList {
        current,
        choices,
        display,
    })
}

fn match_locale(display: &DisplayMap, locale: &str) -> Option<String> {
    let locale = locale.split('@').next().unwrap_or(locale);
    let language = locale.split('_').next().unwrap_or(locale);
    let find = |wanted: &str| {
        display
            .iter()
            .filter(|(_, (_, code))| code == wanted)
            .map(|(trans, _)| trans)
            .min()
            .cloned()
    };
    find(locale).or_else(|| find(language))
}

/// "en_US.UTF-8" -> "en_US". ICU doesn't understand the encoding suffix.
pub fn locale_from_lang(lang: &str) -> String {
    match lang.rsplit_once('.') {
        Some((locale, _)) => locale.to_string(),
        None => lang.to_string(),
    }
}
