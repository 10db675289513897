use crate::codec::{BinaryCodec, Frame};
use crate::drivers::frame_focuser::{NAK_BUSY, NAK_RANGE, OP_HALT, OP_IDENTIFY, OP_MOVE, OP_STATUS};

use super::{split_request, SimDevice};

/// Shared focuser motor model. Motion advances one step per status query.
#[derive(Debug, Clone)]
struct Motor {
    position: i64,
    target: i64,
    moving: bool,
    max: i64,
    step: i64,
    freeze_at: Option<i64>,
    hunt: Option<i64>,
    ignore_halt: bool,
}

impl Motor {
    fn new(position: i64) -> Self {
        Self {
            position,
            target: position,
            moving: false,
            max: 100_000,
            step: 100,
            freeze_at: None,
            hunt: None,
            ignore_halt: false,
        }
    }

    fn advance(&mut self) {
        if !self.moving || self.freeze_at == Some(self.position) {
            return;
        }
        let delta = (self.target - self.position).clamp(-self.step, self.step);
        let mut next = self.position + delta;
        if let Some(freeze) = self.freeze_at {
            let crossed = (self.position < freeze && next > freeze) || (self.position > freeze && next < freeze);
            if crossed {
                next = freeze;
            }
        }
        if let Some(amplitude) = self.hunt.filter(|_| next == self.target) {
            // Overshoot to the far side of the target instead of settling
            next = if self.position < self.target {
                self.target + amplitude
            } else {
                self.target - amplitude
            };
        }
        self.position = next;
        if self.position == self.target {
            self.moving = false;
        }
    }

    /// Start a move; `Err` carries the refusal reason
    fn start(&mut self, target: i64) -> Result<(), u8> {
        if self.moving {
            return Err(NAK_BUSY);
        }
        if !(0..=self.max).contains(&target) {
            return Err(NAK_RANGE);
        }
        self.target = target;
        self.moving = target != self.position;
        Ok(())
    }

    fn halt(&mut self) {
        if !self.ignore_halt {
            self.moving = false;
            self.target = self.position;
        }
    }
}

/// Binary-frame focuser
#[derive(Debug, Clone)]
pub struct FrameFocuserSim {
    motor: Motor,
    temperature_centi: i16,
}

impl FrameFocuserSim {
    /// Focuser at rest at `position`
    pub fn new(position: i64) -> Self {
        Self {
            motor: Motor::new(position),
            temperature_centi: 1250,
        }
    }

    /// Limit travel
    pub fn with_max(mut self, max: i64) -> Self {
        self.motor.max = max;
        self
    }

    /// Steps covered per status query
    pub fn with_step(mut self, step: i64) -> Self {
        self.motor.step = step;
        self
    }

    /// Stall the motor at `position` while still reporting motion
    pub fn freeze_at(mut self, position: i64) -> Self {
        self.motor.freeze_at = Some(position);
        self
    }

    /// Swing `amplitude` steps either side of the target without settling
    pub fn hunt(mut self, amplitude: i64) -> Self {
        self.motor.hunt = Some(amplitude);
        self
    }

    /// Acknowledge halt commands without stopping
    pub fn ignore_halt(mut self) -> Self {
        self.motor.ignore_halt = true;
        self
    }

    /// Current position
    pub fn position(&self) -> i64 {
        self.motor.position
    }

    /// Whether the motor is running
    pub fn is_moving(&self) -> bool {
        self.motor.moving
    }

    fn reply(&self, opcode: u8, payload: Vec<u8>) -> Vec<u8> {
        BinaryCodec::frame_bytes(&Frame::new(opcode | BinaryCodec::default().ack_bit, payload))
            .unwrap_or_default()
    }

    fn refuse(&self, opcode: u8, reason: u8) -> Vec<u8> {
        BinaryCodec::frame_bytes(&Frame::new(BinaryCodec::default().nak_opcode, vec![opcode, reason]))
            .unwrap_or_default()
    }
}

impl SimDevice for FrameFocuserSim {
    fn respond(&mut self, request: &[u8]) -> Vec<u8> {
        // A corrupted request is ignored like on the real wire
        let Ok(frame) = BinaryCodec::parse(request) else {
            return Vec::new();
        };

        match frame.opcode {
            OP_IDENTIFY => self.reply(OP_IDENTIFY, b"FF-SIM 1.0".to_vec()),
            OP_STATUS => {
                self.motor.advance();
                let mut payload = (self.motor.position as i32).to_be_bytes().to_vec();
                payload.push(u8::from(self.motor.moving));
                payload.extend_from_slice(&self.temperature_centi.to_be_bytes());
                self.reply(OP_STATUS, payload)
            }
            OP_MOVE => match frame.i32_at(0, "target") {
                Ok(target) => match self.motor.start(i64::from(target)) {
                    Ok(()) => self.reply(OP_MOVE, target.to_be_bytes().to_vec()),
                    Err(reason) => self.refuse(OP_MOVE, reason),
                },
                Err(_) => self.refuse(OP_MOVE, 0xFF),
            },
            OP_HALT => {
                self.motor.halt();
                self.reply(OP_HALT, Vec::new())
            }
            other => self.refuse(other, 0xFF),
        }
    }
}

/// ASCII step focuser
#[derive(Debug, Clone)]
pub struct StepFocuserSim {
    motor: Motor,
    temperature: f64,
}

impl StepFocuserSim {
    /// Focuser at rest at `position`
    pub fn new(position: i64) -> Self {
        Self {
            motor: Motor::new(position),
            temperature: 8.5,
        }
    }

    /// Steps covered per position query
    pub fn with_step(mut self, step: i64) -> Self {
        self.motor.step = step;
        self
    }

    /// Report the no-probe temperature
    pub fn without_probe(mut self) -> Self {
        self.temperature = -127.0;
        self
    }

    /// Current position
    pub fn position(&self) -> i64 {
        self.motor.position
    }
}

impl SimDevice for StepFocuserSim {
    fn respond(&mut self, request: &[u8]) -> Vec<u8> {
        let (word, args) = split_request(request);
        let fields = match word.as_str() {
            "hello" => "SF-SIM 2.1:step focuser simulator".to_string(),
            "getpos" => {
                self.motor.advance();
                self.motor.position.to_string()
            }
            "ismoving" => u8::from(self.motor.moving).to_string(),
            "gettemp" => format!("{:.1}", self.temperature),
            "goto" => match args.first().and_then(|a| a.parse::<i64>().ok()) {
                Some(target) => match self.motor.start(target) {
                    Ok(()) => "0".to_string(),
                    Err(reason) => reason.to_string(),
                },
                None => "9".to_string(),
            },
            "stop" => {
                self.motor.halt();
                "0".to_string()
            }
            _ => return b"error:unknown command\n".to_vec(),
        };
        format!("{}:{}\n", word, fields).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motor_steps_and_stalls() {
        let mut motor = Motor::new(1000);
        motor.step = 250;
        motor.freeze_at = Some(1500);
        motor.start(2000).unwrap();

        motor.advance();
        assert_eq!(motor.position, 1250);
        motor.advance();
        motor.advance();
        assert_eq!(motor.position, 1500);
        assert!(motor.moving);
        assert_eq!(motor.start(1800), Err(NAK_BUSY));
    }

    #[test]
    fn test_motor_hunts_around_target() {
        let mut motor = Motor::new(1900);
        motor.hunt = Some(1);
        motor.start(2000).unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            motor.advance();
            seen.push(motor.position);
        }
        assert_eq!(seen, vec![2001, 1999, 2001, 1999]);
        assert!(motor.moving);
    }

    #[test]
    fn test_frame_status_reply() {
        let mut sim = FrameFocuserSim::new(1000);
        let request = BinaryCodec::frame_bytes(&Frame::bare(OP_STATUS)).unwrap();
        let reply = BinaryCodec::parse(&sim.respond(&request)).unwrap();
        assert_eq!(reply.opcode, OP_STATUS | 0x80);
        assert_eq!(reply.i32_at(0, "position").unwrap(), 1000);
        assert_eq!(reply.u8_at(4, "moving").unwrap(), 0);
    }

    #[test]
    fn test_step_focuser_words() {
        let mut sim = StepFocuserSim::new(50);
        assert_eq!(sim.respond(b"goto 300\n"), b"goto:0\n");
        assert_eq!(sim.respond(b"getpos\n"), b"getpos:150\n");
        assert_eq!(sim.respond(b"goto 10\n"), b"goto:2\n");
        assert_eq!(sim.respond(b"stop\n"), b"stop:0\n");
        assert_eq!(sim.respond(b"ismoving\n"), b"ismoving:0\n");
    }
}
