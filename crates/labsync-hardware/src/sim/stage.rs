//! Simulated servo stage speaking the SDO frame protocol.

use std::collections::{BTreeMap, HashMap};

use super::{Framing, Instrument};
use crate::drivers::stage::{
    checksum, encode_frame, object, CMD_ABORT, CMD_READ, CMD_READ_REPLY, CMD_WRITE, CMD_WRITE_REPLY,
    CONTROL_HOMING_START, CONTROL_RESET_ERROR, CONTROL_START, FRAME_LEN,
};

const ABORT_UNSUPPORTED: i32 = 0x0504_0001;
const STATUS_READY: i32 = 0x0027;
const STATUS_TARGET_REACHED: i32 = 0x0400;

pub(crate) struct SimStage {
    objects: HashMap<u16, i32>,
    position: i32,
    error_code: i32,
}

impl SimStage {
    pub(crate) fn new() -> Self {
        Self {
            objects: HashMap::new(),
            position: 0,
            error_code: 0,
        }
    }

    fn read(&self, index: u16) -> i32 {
        match index {
            object::ACTUAL_POSITION => self.position,
            object::STATUS_WORD => STATUS_READY | STATUS_TARGET_REACHED,
            object::ERROR_CODE => self.error_code,
            other => self.objects.get(&other).copied().unwrap_or(0),
        }
    }

    fn write(&mut self, index: u16, value: i32) {
        self.objects.insert(index, value);
        if index == object::CONTROL_WORD {
            match value {
                CONTROL_START => {
                    self.position = self.objects.get(&object::TARGET_POSITION).copied().unwrap_or(0);
                }
                CONTROL_HOMING_START => self.position = 0,
                CONTROL_RESET_ERROR => self.error_code = 0,
                _ => {}
            }
        }
    }

    fn publish(&self, registers: &mut BTreeMap<String, String>) {
        registers.insert("position_counts".into(), self.position.to_string());
        for (name, index) in [
            ("target_position_counts", object::TARGET_POSITION),
            ("speed_counts", object::SPEED),
            ("acceleration_counts", object::ACCELERATION),
            ("deceleration_counts", object::DECELERATION),
            ("control_word", object::CONTROL_WORD),
        ] {
            registers.insert(name.into(), self.read(index).to_string());
        }
    }
}

impl Instrument for SimStage {
    fn framing(&self) -> Framing {
        Framing::Fixed(FRAME_LEN)
    }

    fn respond(&mut self, frame: &[u8], registers: &mut BTreeMap<String, String>) -> Vec<u8> {
        if frame.len() != FRAME_LEN {
            self.publish(registers);
            return Vec::new();
        }

        let index = u16::from_le_bytes([frame[2], frame[3]]);
        let data = i32::from_le_bytes([frame[5], frame[6], frame[7], frame[8]]);

        let reply = if checksum(&frame[..FRAME_LEN - 1]) != frame[FRAME_LEN - 1] {
            encode_frame(CMD_ABORT, index, ABORT_UNSUPPORTED)
        } else {
            match frame[1] {
                CMD_WRITE => {
                    self.write(index, data);
                    encode_frame(CMD_WRITE_REPLY, index, 0)
                }
                CMD_READ => encode_frame(CMD_READ_REPLY, index, self.read(index)),
                _ => encode_frame(CMD_ABORT, index, ABORT_UNSUPPORTED),
            }
        };
        self.publish(registers);

        // The controller echoes the request before answering.
        let mut out = frame.to_vec();
        out.extend_from_slice(&reply);
        out
    }
}
