//! ALSA device listing parser
//!
//! Turns `arecord -l` / `aplay -l` output into `plughw:N,M` device strings.

use regex::Regex;
use std::sync::OnceLock;

/// One card/device pair from a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlsaDevice {
    pub card: u32,
    pub card_name: String,
    pub device: u32,
    pub device_name: String,
}

impl AlsaDevice {
    /// Device string accepted by ALSA tools and ffmpeg
    pub fn plughw(&self) -> String {
        format!("plughw:{},{}", self.card, self.device)
    }

    pub fn label(&self) -> String {
        format!("{} - {}", self.card_name, self.device_name)
    }

    /// Case-insensitive keyword match against card and device names
    pub fn matches_any(&self, keywords: &[String]) -> bool {
        let haystack = format!("{} {}", self.card_name, self.device_name).to_lowercase();
        keywords
            .iter()
            .any(|k| !k.is_empty() && haystack.contains(&k.to_lowercase()))
    }
}

fn line_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"card\s+(\d+):\s*([^,\[]+)(?:\[[^\]]*\])?,\s*device\s+(\d+):\s*([^\[\n]+)").ok()
        })
        .as_ref()
}

/// Parse every `card N: ..., device M: ...` line, in listing order
pub fn parse_listing(output: &str) -> Vec<AlsaDevice> {
    let Some(pattern) = line_pattern() else {
        return Vec::new();
    };
    output
        .lines()
        .filter_map(|line| {
            let caps = pattern.captures(line)?;
            Some(AlsaDevice {
                card: caps[1].parse().ok()?,
                card_name: caps[2].trim().to_string(),
                device: caps[3].parse().ok()?,
                device_name: caps[4].trim().to_string(),
            })
        })
        .collect()
}
