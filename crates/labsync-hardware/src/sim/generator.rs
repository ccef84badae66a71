//! Simulated four-channel function generator.
//!
//! Settings are silently stored per selected channel; only `*IDN?` and
//! `EER?` produce a reply.

use std::collections::BTreeMap;

use super::{Framing, Instrument};

const IDENTITY: &str = "THURLBY THANDAR,TGA1244,SIM,1.0";

pub(crate) struct SimGenerator {
    selected: u8,
    settings: BTreeMap<String, String>,
    execution_error: u32,
}

impl SimGenerator {
    pub(crate) fn new() -> Self {
        Self {
            selected: 1,
            settings: BTreeMap::new(),
            execution_error: 0,
        }
    }

    fn handle(&mut self, line: &str) -> Option<String> {
        if let Some(channel) = line.strip_prefix("SETUPCH") {
            match channel.trim().parse::<u8>() {
                Ok(ch @ 1..=4) => self.selected = ch,
                _ => self.execution_error = 113,
            }
            return None;
        }

        match line {
            "*IDN?" => Some(IDENTITY.to_string()),
            "EER?" => Some(std::mem::take(&mut self.execution_error).to_string()),
            _ => {
                match line.split_once(' ') {
                    Some((command, value)) => {
                        self.settings
                            .insert(format!("{}[{}]", command, self.selected), value.trim().to_string());
                    }
                    None => self.execution_error = 113,
                }
                None
            }
        }
    }
}

impl Instrument for SimGenerator {
    fn framing(&self) -> Framing {
        Framing::Line(b'\n')
    }

    fn respond(&mut self, frame: &[u8], registers: &mut BTreeMap<String, String>) -> Vec<u8> {
        let line = String::from_utf8_lossy(frame).trim().to_string();
        let reply = if line.is_empty() { None } else { self.handle(&line) };

        registers.insert("selected_channel".into(), self.selected.to_string());
        for (key, value) in &self.settings {
            registers.insert(key.clone(), value.clone());
        }

        reply.map(|r| format!("{}\n", r).into_bytes()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_selected_channel() {
        let mut generator = SimGenerator::new();
        let mut registers = BTreeMap::new();

        for line in ["SETUPCH2", "WAVFREQ 1000"] {
            assert!(generator.respond(line.as_bytes(), &mut registers).is_empty());
        }
        assert_eq!(registers.get("WAVFREQ[2]").map(String::as_str), Some("1000"));
        assert_eq!(generator.respond(b"EER?", &mut registers), b"0\n");
    }
}
