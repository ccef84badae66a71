//! Simulated SCPI spectrum analyzer.
//!
//! Lines may carry several `;`-separated commands. Replies of every query on a
//! line are joined with `;` into one response line, as the real instrument
//! does. Traces are computed from an amplitude model over the configured
//! center, span and point count.

use std::collections::BTreeMap;

use super::{Framing, Instrument};

const IDENTITY: &str = "Rohde&Schwarz,FSV3004,SIM,1.0";

/// First-order low-pass with a 10 kHz corner, in dBm.
pub fn low_pass_response(frequency_hz: f64) -> f64 {
    let ratio = frequency_hz / 1.0e4;
    -10.0 - 10.0 * (1.0 + ratio * ratio).log10()
}

pub(crate) struct SimAnalyzer {
    settings: BTreeMap<&'static str, String>,
    traces_served: usize,
    fail_at: Option<usize>,
    model: fn(f64) -> f64,
    errors: Vec<String>,
}

impl SimAnalyzer {
    pub(crate) fn new(fail_at: Option<usize>, model: fn(f64) -> f64) -> Self {
        let mut settings = BTreeMap::new();
        for (name, value) in [
            ("FREQ:CENT", "1000"),
            ("FREQ:SPAN", "1000"),
            ("BAND", "100"),
            ("SWE:TYPE", "SWE"),
            ("UNIT:POW", "DBM"),
            ("SWE:POIN", "2001"),
            ("AVER:COUN", "64"),
            ("SWE:COUN", "1"),
            ("FORM", "ASC"),
            ("INIT:CONT", "ON"),
            ("DISP:TRAC1:MODE", "WRIT"),
        ] {
            settings.insert(name, value.to_string());
        }
        Self {
            settings,
            traces_served: 0,
            fail_at,
            model,
            errors: Vec::new(),
        }
    }

    fn number(&self, name: &str) -> f64 {
        self.settings
            .get(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    fn axis(&self) -> Vec<f64> {
        let center = self.number("FREQ:CENT");
        let span = self.number("FREQ:SPAN");
        let points = (self.number("SWE:POIN") as usize).max(2);
        let start = center - span / 2.0;
        (0..points)
            .map(|i| start + span * i as f64 / (points - 1) as f64)
            .collect()
    }

    fn join(values: impl Iterator<Item = String>) -> String {
        values.collect::<Vec<_>>().join(",")
    }

    fn query(&mut self, header: &str) -> String {
        match header {
            "*IDN?" => IDENTITY.to_string(),
            "*OPC?" => "1".to_string(),
            "SYST:ERR?" => {
                if self.errors.is_empty() {
                    "0,\"No error\"".to_string()
                } else {
                    format!("-113,\"{}\"", self.errors.remove(0))
                }
            }
            "TRAC:DATA? TRACE1" => {
                let index = self.traces_served;
                self.traces_served += 1;
                if self.fail_at == Some(index) {
                    return "#ERR".to_string();
                }
                let model = self.model;
                Self::join(self.axis().into_iter().map(|f| format!("{:.3}", model(f))))
            }
            "TRAC:DATA:X? TRACE1" => Self::join(self.axis().into_iter().map(|f| f.to_string())),
            other => {
                let name = other.trim_end_matches('?');
                match self.settings.get(name) {
                    Some(value) => value.clone(),
                    None => {
                        self.errors.push(format!("Undefined header: {}", other));
                        String::new()
                    }
                }
            }
        }
    }

    fn set(&mut self, command: &str) {
        let (header, value) = command.split_once(' ').unwrap_or((command, ""));
        let known = self.settings.keys().find(|k| **k == header).copied();
        match (known, header) {
            (Some(key), _) => {
                self.settings.insert(key, value.trim().to_string());
            }
            (None, "ABOR" | "INIT:IMM" | "*WAI" | "*CLS") => {}
            (None, _) => self.errors.push(format!("Undefined header: {}", command)),
        }
    }

    fn publish(&self, registers: &mut BTreeMap<String, String>) {
        for (register, header) in [
            ("center_frequency", "FREQ:CENT"),
            ("span", "FREQ:SPAN"),
            ("bandwidth", "BAND"),
            ("sweep_type", "SWE:TYPE"),
            ("unit", "UNIT:POW"),
            ("sweep_points", "SWE:POIN"),
            ("average_count", "AVER:COUN"),
            ("sweep_count", "SWE:COUN"),
            ("trace_mode", "DISP:TRAC1:MODE"),
        ] {
            if let Some(value) = self.settings.get(header) {
                registers.insert(register.into(), value.clone());
            }
        }
        registers.insert("traces_served".into(), self.traces_served.to_string());
    }
}

impl Instrument for SimAnalyzer {
    fn framing(&self) -> Framing {
        Framing::Line(b'\n')
    }

    fn respond(&mut self, frame: &[u8], registers: &mut BTreeMap<String, String>) -> Vec<u8> {
        let line = String::from_utf8_lossy(frame).trim().to_string();
        let mut replies = Vec::new();
        for command in line.split(';').map(str::trim).filter(|c| !c.is_empty()) {
            if command.contains('?') {
                replies.push(self.query(command));
            } else {
                self.set(command);
            }
        }
        self.publish(registers);

        if replies.is_empty() {
            Vec::new()
        } else {
            format!("{}\n", replies.join(";")).into_bytes()
        }
    }
}
