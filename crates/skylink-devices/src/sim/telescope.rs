use serde_json::{json, Value as Json};

use crate::codec::rest::{ERROR_INVALID_WHILE_PARKED, ERROR_NOT_IMPLEMENTED};

use super::SimDevice;

const RA_STEP: f64 = 1.0;
const DEC_STEP: f64 = 10.0;

/// Alpaca telescope server
#[derive(Debug, Clone)]
pub struct TelescopeSim {
    ra: f64,
    dec: f64,
    target: Option<(f64, f64)>,
    parked: bool,
    park_delay: u32,
    parking: Option<u32>,
    at_home: bool,
    server_transaction: u32,
}

/// Decode `%XX` escapes of a form or query component
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let decoded = (bytes[i] == b'%')
            .then(|| s.get(i + 1..i + 3))
            .flatten()
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());
        match decoded {
            Some(b) => {
                out.push(b);
                i += 3;
            }
            None => {
                out.push(if bytes[i] == b'+' { b' ' } else { bytes[i] });
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_pairs(s: &str) -> Vec<(String, String)> {
    s.split('&')
        .filter(|p| !p.is_empty())
        .map(|p| {
            let (k, v) = p.split_once('=').unwrap_or((p, ""));
            (percent_decode(k), percent_decode(v))
        })
        .collect()
}

impl TelescopeSim {
    /// Unparked mount pointing at the given coordinates
    pub fn new(ra: f64, dec: f64) -> Self {
        Self {
            ra,
            dec,
            target: None,
            parked: false,
            park_delay: 0,
            parking: None,
            at_home: false,
            server_transaction: 0,
        }
    }

    /// Start parked
    pub fn parked(mut self) -> Self {
        self.parked = true;
        self
    }

    /// Keep reporting not parked for `reads` status reads after a park command
    pub fn with_park_delay(mut self, reads: u32) -> Self {
        self.park_delay = reads;
        self
    }

    /// Whether a slew or a park is running
    pub fn is_slewing(&self) -> bool {
        self.target.is_some() || self.parking.is_some()
    }

    fn at_park(&mut self) -> bool {
        match self.parking {
            Some(0) => {
                self.parking = None;
                self.parked = true;
            }
            Some(n) => self.parking = Some(n - 1),
            None => {}
        }
        self.parked
    }

    fn advance(&mut self) {
        let Some((ra, dec)) = self.target else {
            return;
        };
        let dra = (ra - self.ra + 36.0).rem_euclid(24.0) - 12.0;
        let ddec = dec - self.dec;
        if dra.abs() <= RA_STEP && ddec.abs() <= DEC_STEP {
            self.ra = ra;
            self.dec = dec;
            self.target = None;
            return;
        }
        self.ra = (self.ra + dra.clamp(-RA_STEP, RA_STEP)).rem_euclid(24.0);
        self.dec += ddec.clamp(-DEC_STEP, DEC_STEP);
    }

    fn handle(&mut self, method: &str, command: &str, params: &[(String, String)]) -> Result<Json, (i32, String)> {
        let param = |name: &str| -> Result<f64, (i32, String)> {
            params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .and_then(|(_, v)| v.parse().ok())
                .ok_or((0x401, format!("missing or invalid {}", name)))
        };
        let parked_error = || (ERROR_INVALID_WHILE_PARKED, "Invalid while parked".to_string());

        match (method, command) {
            ("GET", "name") => Ok(json!("Alpaca Telescope Simulator")),
            ("PUT", "connected") => Ok(Json::Null),
            ("GET", "rightascension") => {
                self.advance();
                Ok(json!(self.ra))
            }
            ("GET", "declination") => Ok(json!(self.dec)),
            ("GET", "slewing") => Ok(json!(self.is_slewing())),
            ("GET", "atpark") => Ok(json!(self.at_park())),
            ("GET", "athome") => Ok(json!(self.at_home)),
            ("PUT", "slewtocoordinatesasync") => {
                if self.parked {
                    return Err(parked_error());
                }
                self.target = Some((param("RightAscension")?, param("Declination")?));
                self.at_home = false;
                Ok(Json::Null)
            }
            ("PUT", "park") => {
                self.target = None;
                if self.park_delay == 0 {
                    self.parked = true;
                } else {
                    self.parking = Some(self.park_delay);
                }
                Ok(Json::Null)
            }
            ("PUT", "unpark") => {
                self.parking = None;
                self.parked = false;
                Ok(Json::Null)
            }
            ("PUT", "findhome") => {
                if self.parked {
                    return Err(parked_error());
                }
                self.target = None;
                self.at_home = true;
                Ok(Json::Null)
            }
            ("PUT", "abortslew") => {
                self.target = None;
                Ok(Json::Null)
            }
            _ => Err((ERROR_NOT_IMPLEMENTED, format!("{} {} not implemented", method, command))),
        }
    }
}

impl SimDevice for TelescopeSim {
    fn respond(&mut self, request: &[u8]) -> Vec<u8> {
        let text = String::from_utf8_lossy(request).into_owned();
        let (line, body) = text.split_once('\n').unwrap_or((text.as_str(), ""));
        let (method, target) = line.split_once(' ').unwrap_or((line, ""));
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        let command = path.rsplit('/').next().unwrap_or_default().to_ascii_lowercase();

        let mut params = parse_pairs(query);
        params.extend(parse_pairs(body));
        let client_transaction = params
            .iter()
            .find(|(k, _)| k == "ClientTransactionID")
            .and_then(|(_, v)| v.parse::<u32>().ok())
            .unwrap_or(0);

        self.server_transaction += 1;
        let (value, error_number, error_message) = match self.handle(method, &command, &params) {
            Ok(value) => (value, 0, String::new()),
            Err((number, message)) => (Json::Null, number, message),
        };
        let reply = json!({
            "Value": value,
            "ClientTransactionID": client_transaction,
            "ServerTransactionID": self.server_transaction,
            "ErrorNumber": error_number,
            "ErrorMessage": error_message,
        });
        format!("{}\n", reply).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(sim: &mut TelescopeSim, request: &str) -> Json {
        serde_json::from_slice(&sim.respond(request.as_bytes())).unwrap()
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a%20b%26c"), "a b&c");
        assert_eq!(percent_decode("-10.25"), "-10.25");
        assert_eq!(percent_decode("bad%zz"), "bad%zz");
    }

    #[test]
    fn test_slew_progresses_on_reads() {
        let mut sim = TelescopeSim::new(1.0, 10.0);
        let started = reply(
            &mut sim,
            "PUT /api/v1/telescope/0/slewtocoordinatesasync\nClientID=1&ClientTransactionID=3&RightAscension=3.5&Declination=25",
        );
        assert_eq!(started["ErrorNumber"], 0);
        assert_eq!(started["ClientTransactionID"], 3);

        let ra = reply(&mut sim, "GET /api/v1/telescope/0/rightascension?ClientTransactionID=4\n");
        assert_eq!(ra["Value"], 2.0);
        assert!(sim.is_slewing());
        for _ in 0..2 {
            reply(&mut sim, "GET /api/v1/telescope/0/rightascension\n");
        }
        assert!(!sim.is_slewing());
    }

    #[test]
    fn test_parked_and_unknown_commands() {
        let mut sim = TelescopeSim::new(0.0, 90.0).parked();
        let refused = reply(
            &mut sim,
            "PUT /api/v1/telescope/0/slewtocoordinatesasync\nRightAscension=1&Declination=2",
        );
        assert_eq!(refused["ErrorNumber"], ERROR_INVALID_WHILE_PARKED);

        let unknown = reply(&mut sim, "GET /api/v1/telescope/0/sideofpier\n");
        assert_eq!(unknown["ErrorNumber"], ERROR_NOT_IMPLEMENTED);
    }

    #[test]
    fn test_slow_park() {
        let mut sim = TelescopeSim::new(4.0, 30.0).with_park_delay(2);
        reply(&mut sim, "PUT /api/v1/telescope/0/park\nClientID=1");
        assert!(sim.is_slewing());
        for _ in 0..2 {
            let at_park = reply(&mut sim, "GET /api/v1/telescope/0/atpark\n");
            assert_eq!(at_park["Value"], false);
        }
        let at_park = reply(&mut sim, "GET /api/v1/telescope/0/atpark\n");
        assert_eq!(at_park["Value"], true);
        assert!(!sim.is_slewing());
    }
}
