//! Simulated diode laser speaking the `?CMD` / `!CMD` ASCII protocol.

use std::collections::BTreeMap;
use std::time::Duration;

use super::{Framing, Instrument};

const FIRMWARE: &str = "LuxX+|SIM|1.0";
const MAX_POWER_MW: u32 = 200;

pub(crate) struct SimLaser {
    operating_mode: u8,
    power: f64,
    emission: bool,
    powered: bool,
    reset_delay: Duration,
    rejected: Option<&'static str>,
}

impl SimLaser {
    pub(crate) fn new() -> Self {
        Self {
            operating_mode: 0,
            power: 0.0,
            emission: false,
            powered: false,
            reset_delay: Duration::ZERO,
            rejected: None,
        }
    }

    pub(crate) fn with_reset_delay(mut self, delay: Duration) -> Self {
        self.reset_delay = delay;
        self
    }

    pub(crate) fn rejecting(mut self, command: Option<&'static str>) -> Self {
        self.rejected = command;
        self
    }

    fn status_word(&self) -> u32 {
        let mut word = 0;
        if self.emission {
            word |= 0x0002;
        }
        word
    }

    fn handle(&mut self, command: &str, args: &str) -> String {
        if self.rejected == Some(command) {
            return "x".into();
        }
        match command {
            "GFw" => FIRMWARE.to_string(),
            "GMP" => MAX_POWER_MW.to_string(),
            "POn" => {
                self.powered = true;
                ">".into()
            }
            "SOM" => ">".into(),
            "RsC" => {
                self.emission = false;
                self.operating_mode = 0;
                ">".into()
            }
            "ROM" if args.is_empty() => self.operating_mode.to_string(),
            "ROM" => match args.parse::<u8>() {
                Ok(mode) if mode <= 5 => {
                    self.operating_mode = mode;
                    ">".into()
                }
                _ => "x".into(),
            },
            "TPP" => match args.parse::<f64>() {
                Ok(pct) if (0.0..=100.0).contains(&pct) => {
                    self.power = pct;
                    ">".into()
                }
                _ => "x".into(),
            },
            "TTP" => self.power.to_string(),
            "LOn" => {
                self.emission = true;
                ">".into()
            }
            "LOf" => {
                self.emission = false;
                ">".into()
            }
            "GAS" => format!("{:04X}", self.status_word()),
            "GLF" => "0000".into(),
            _ => "x".into(),
        }
    }

    fn publish(&self, registers: &mut BTreeMap<String, String>) {
        registers.insert("operating_mode".into(), self.operating_mode.to_string());
        registers.insert("power".into(), self.power.to_string());
        registers.insert("emission".into(), self.emission.to_string());
        registers.insert("powered".into(), self.powered.to_string());
    }
}

impl Instrument for SimLaser {
    fn framing(&self) -> Framing {
        Framing::Line(b'\r')
    }

    fn busy_for(&self, frame: &[u8]) -> Duration {
        if frame.starts_with(b"?RsC") {
            self.reset_delay
        } else {
            Duration::ZERO
        }
    }

    fn respond(&mut self, frame: &[u8], registers: &mut BTreeMap<String, String>) -> Vec<u8> {
        let text = String::from_utf8_lossy(frame);
        let reply = match text.trim().strip_prefix('?') {
            Some(request) if request.len() >= 3 && request.is_char_boundary(3) => {
                let (command, args) = request.split_at(3);
                let payload = self.handle(command, args);
                format!("!{}{}\r", command, payload).into_bytes()
            }
            Some(_) => b"!x\r".to_vec(),
            None => Vec::new(),
        };
        self.publish(registers);
        reply
    }
}
