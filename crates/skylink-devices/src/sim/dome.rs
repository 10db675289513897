use super::{split_request, SimDevice};

const ROTATION_STEP: f64 = 10.0;
const SHUTTER_STEP: f64 = 30.0;
const SHUTTER_OPEN_POSITION: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutter {
    Open = 1,
    Opening = 2,
    Closed = 3,
    Closing = 4,
}

/// Battery powered dome rotator with a shutter
#[derive(Debug, Clone)]
pub struct DomeSim {
    azimuth: f64,
    target: Option<f64>,
    home_azimuth: f64,
    main_centivolts: u32,
    shutter_centivolts: u32,
    shutter: Shutter,
    shutter_position: f64,
}

impl DomeSim {
    /// Dome at rest at `azimuth` with the shutter closed
    pub fn new(azimuth: f64) -> Self {
        Self {
            azimuth,
            target: None,
            home_azimuth: 0.0,
            main_centivolts: 1250,
            shutter_centivolts: 1180,
            shutter: Shutter::Closed,
            shutter_position: 0.0,
        }
    }

    /// Set the motor battery level
    pub fn with_battery(mut self, volts: f64) -> Self {
        self.set_battery(volts);
        self
    }

    /// Change the motor battery level
    pub fn set_battery(&mut self, volts: f64) {
        self.main_centivolts = (volts * 100.0).round().max(0.0) as u32;
    }

    /// Current azimuth
    pub fn azimuth(&self) -> f64 {
        self.azimuth
    }

    fn powered(&self) -> bool {
        self.main_centivolts > 700
    }

    fn advance(&mut self) {
        if let Some(target) = self.target {
            if self.powered() {
                let delta = (target - self.azimuth + 540.0).rem_euclid(360.0) - 180.0;
                if delta.abs() <= ROTATION_STEP {
                    self.azimuth = target;
                    self.target = None;
                } else {
                    self.azimuth = (self.azimuth + ROTATION_STEP.copysign(delta)).rem_euclid(360.0);
                }
            }
        }

        match self.shutter {
            Shutter::Opening => {
                self.shutter_position = (self.shutter_position + SHUTTER_STEP).min(SHUTTER_OPEN_POSITION);
                if self.shutter_position >= SHUTTER_OPEN_POSITION {
                    self.shutter = Shutter::Open;
                }
            }
            Shutter::Closing => {
                self.shutter_position = (self.shutter_position - SHUTTER_STEP).max(0.0);
                if self.shutter_position <= 0.0 {
                    self.shutter = Shutter::Closed;
                }
            }
            _ => {}
        }
    }

    fn at_home(&self) -> bool {
        let d = (self.azimuth - self.home_azimuth).rem_euclid(360.0);
        d.min(360.0 - d) < 0.5
    }
}

impl SimDevice for DomeSim {
    fn respond(&mut self, request: &[u8]) -> Vec<u8> {
        let (word, args) = split_request(request);
        let reply = match word.as_str() {
            "v" => "V3.1.0".to_string(),
            "m" => {
                self.advance();
                format!("M{}", u8::from(self.target.is_some()))
            }
            "q" => format!("Q{:.1}", self.azimuth),
            "k" => format!("K {} {}", self.main_centivolts, self.shutter_centivolts),
            "u" => format!("U{}", self.shutter as u8),
            "b" => format!("B{:.1}", self.shutter_position),
            "z" => format!("Z{}", u8::from(self.at_home())),
            "g" => match args.first().and_then(|a| a.parse::<f64>().ok()) {
                Some(az) => {
                    self.target = Some(az.rem_euclid(360.0));
                    "G".to_string()
                }
                None => "X".to_string(),
            },
            "h" => {
                self.target = Some(self.home_azimuth);
                "H".to_string()
            }
            "d" => {
                self.shutter = Shutter::Opening;
                "D".to_string()
            }
            "e" => {
                self.shutter = Shutter::Closing;
                "E".to_string()
            }
            "a" => {
                self.target = None;
                "A".to_string()
            }
            _ => "X".to_string(),
        };
        format!("{}\n", reply).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_takes_short_way() {
        let mut sim = DomeSim::new(350.0);
        sim.respond(b"g 15.0\n");
        assert_eq!(sim.respond(b"m\n"), b"M1\n");
        assert_eq!(sim.azimuth(), 0.0);
        sim.respond(b"m\n");
        sim.respond(b"m\n");
        assert_eq!(sim.azimuth(), 15.0);
        assert_eq!(sim.respond(b"m\n"), b"M0\n");
    }

    #[test]
    fn test_unpowered_motor_stalls() {
        let mut sim = DomeSim::new(10.0).with_battery(6.5);
        sim.respond(b"g 90.0\n");
        sim.respond(b"m\n");
        assert_eq!(sim.azimuth(), 10.0);
        assert_eq!(sim.respond(b"k\n"), b"K 650 1180\n");
    }

    #[test]
    fn test_shutter_cycle() {
        let mut sim = DomeSim::new(0.0);
        sim.respond(b"d\n");
        assert_eq!(sim.respond(b"u\n"), b"U2\n");
        for _ in 0..3 {
            sim.respond(b"m\n");
        }
        assert_eq!(sim.respond(b"u\n"), b"U1\n");
        assert_eq!(sim.respond(b"b\n"), b"B90.0\n");
    }
}
