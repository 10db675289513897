use super::SimDevice;

/// Three-output dew heater controller
#[derive(Debug, Clone)]
pub struct DewHeaterSim {
    temperatures: [f64; 3],
    humidity: f64,
    dew_point: f64,
    outputs: [u8; 3],
    auto_mode: bool,
}

impl Default for DewHeaterSim {
    fn default() -> Self {
        Self::new()
    }
}

impl DewHeaterSim {
    /// Controller with all outputs off
    pub fn new() -> Self {
        Self {
            temperatures: [22.37, 22.62, 23.35],
            humidity: 50.77,
            dew_point: 12.55,
            outputs: [0; 3],
            auto_mode: false,
        }
    }

    /// Report this relative humidity
    pub fn with_humidity(mut self, humidity: f64) -> Self {
        self.humidity = humidity;
        self
    }

    /// Report automatic mode
    pub fn with_auto_mode(mut self) -> Self {
        self.auto_mode = true;
        self
    }

    /// Output levels in percent
    pub fn outputs(&self) -> [u8; 3] {
        self.outputs
    }

    fn set_output(&mut self, request: &[u8]) -> Option<()> {
        // S<channel>O<level:3>
        if request.len() != 6 || request[0] != b'S' || request[2] != b'O' {
            return None;
        }
        let channel = (request[1] as char).to_digit(10)? as usize;
        let level: u8 = std::str::from_utf8(&request[3..]).ok()?.parse().ok()?;
        if level > 100 {
            return None;
        }
        *self.outputs.get_mut(channel.checked_sub(1)?)? = level;
        Some(())
    }
}

impl SimDevice for DewHeaterSim {
    fn respond(&mut self, request: &[u8]) -> Vec<u8> {
        let reply = match request {
            b"SWHOIS" => "UDP2(1446)".to_string(),
            b"SGETAL" => {
                let [t1, t2, ambient] = self.temperatures;
                let [o1, o2, o3] = self.outputs;
                format!(
                    "##{:.2}/{:.2}/{:.2}/{:.2}/{:.2}/{}/{}/{}/0/0/0/2/2/{}/0/4**",
                    t1,
                    t2,
                    ambient,
                    self.humidity,
                    self.dew_point,
                    o1,
                    o2,
                    o3,
                    u8::from(self.auto_mode)
                )
            }
            _ => match self.set_output(request) {
                Some(()) => "DONE".to_string(),
                None => "ERROR".to_string(),
            },
        };
        format!("{}\n", reply).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_line() {
        let mut sim = DewHeaterSim::new();
        assert_eq!(sim.respond(b"S3O100"), b"DONE\n");
        assert_eq!(
            sim.respond(b"SGETAL"),
            b"##22.37/22.62/23.35/50.77/12.55/0/0/100/0/0/0/2/2/0/0/4**\n"
        );
    }

    #[test]
    fn test_bad_output_commands() {
        let mut sim = DewHeaterSim::new();
        assert_eq!(sim.respond(b"S4O010"), b"ERROR\n");
        assert_eq!(sim.respond(b"S1O101"), b"ERROR\n");
        assert_eq!(sim.respond(b"S1O10"), b"ERROR\n");
        assert_eq!(sim.outputs(), [0, 0, 0]);
    }
}
