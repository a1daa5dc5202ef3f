//! System configuration: per-device option groups read once at start
//!
//! Every field has a default, so an empty file (or `{}`) is a valid
//! configuration. Durations are written as in
//! [humantime](https://docs.rs/humantime/), e.g. `200ms` or `1s`.
//!
//! ```json
//! {
//!     "timy": { "baudrate": 9600, "chandelay": { "C2": "0.200" } },
//!     "rrs": { "allowstored": true, "passiveloop": 2 },
//!     "rru": { "decoderconfig": { "Channel ID": "auto" } },
//!     "thbc": { "levels": 40, "ipaddr": "192.168.95.252" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use todtools::chan::chan2id;
use todtools::{mktod, Tod};
use tracing::{debug, warn};

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct SysConf {
    pub timy: TimyConf,
    pub rrs: RrsConf,
    pub rru: RruConf,
    pub thbc: ThbcConf,
}

impl SysConf {
    /// Read a JSON configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<SysConf> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let conf: SysConf = serde_json::from_str(&text)?;
        debug!("loaded system config from {}", path.display());
        Ok(conf)
    }
}

/// Alge Timy chronoprinter
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TimyConf {
    pub baudrate: u32,
    pub ctsrts: bool,
    /// Channel name to delay, subtracted from every impulse on that channel
    pub chandelay: BTreeMap<String, String>,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
}

impl Default for TimyConf {
    fn default() -> Self {
        TimyConf {
            baudrate: 38400,
            ctsrts: false,
            chandelay: BTreeMap::new(),
            read_timeout: Duration::from_millis(200),
        }
    }
}

impl TimyConf {
    /// Parsed channel delays indexed by channel number
    pub fn delays(&self) -> BTreeMap<u8, Tod> {
        let mut ret = BTreeMap::new();
        for (chan, val) in self.chandelay.iter() {
            match (chan2id(chan), mktod(val)) {
                (Some(c), Some(d)) => {
                    debug!("channel delay {}: {}", chan, val);
                    ret.insert(c, d);
                }
                _ => warn!("ignoring channel delay {:?}: {:?}", chan, val),
            }
        }
        return ret;
    }
}

/// Race Result System decoder
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RrsConf {
    /// TCP port used when the address does not name one
    pub port: u16,
    /// Report passings read back from active storage
    pub allowstored: bool,
    /// Loop assigned to passive passings without one
    pub passiveloop: u8,
    /// Transponder id of trigger passings
    pub trigno: String,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
}

impl Default for RrsConf {
    fn default() -> Self {
        RrsConf {
            port: 3601,
            allowstored: false,
            passiveloop: 1,
            trigno: String::from("99999"),
            read_timeout: Duration::from_secs(1),
        }
    }
}

/// Race Result USB active decoder
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RruConf {
    pub baudrate: u32,
    pub allowstored: bool,
    /// Option label to hex value, `auto` for a surveyed channel id
    pub decoderconfig: BTreeMap<String, String>,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
}

impl Default for RruConf {
    fn default() -> Self {
        RruConf {
            baudrate: 19200,
            allowstored: false,
            decoderconfig: BTreeMap::new(),
            read_timeout: Duration::from_secs(1),
        }
    }
}

/// Tag Heuer / Chronelec decoder
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ThbcConf {
    pub baudrate: u32,
    pub udp_port: u16,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    pub tod: bool,
    pub gpssync: bool,
    pub tzhour: u8,
    pub tzmin: u8,
    pub dist485: bool,
    pub distfibre: bool,
    pub serprint: bool,
    pub detectmax: bool,
    pub protocol: u8,
    pub syncpulse: bool,
    pub syncinterval: u8,
    pub cellsync: bool,
    pub cellhour: u8,
    pub cellmin: u8,
    pub activeloop: bool,
    /// Tone frequencies in Hz
    pub sta: u16,
    #[serde(rename = "box")]
    pub boxtone: u16,
    pub man: u16,
    pub cel: u16,
    pub bxx: u16,
    /// Detection level forced on STA and BOX at `sane`, 0 to 99
    pub levels: Option<u8>,
    pub ipaddr: String,
    pub netmask: String,
    pub gateway: String,
    pub host: String,
}

impl Default for ThbcConf {
    fn default() -> Self {
        ThbcConf {
            baudrate: 19200,
            udp_port: 2008,
            read_timeout: Duration::from_millis(200),
            tod: true,
            gpssync: false,
            tzhour: 0,
            tzmin: 0,
            dist485: false,
            distfibre: false,
            serprint: false,
            detectmax: false,
            protocol: 0,
            syncpulse: false,
            syncinterval: 60,
            cellsync: false,
            cellhour: 0,
            cellmin: 0,
            activeloop: true,
            sta: 514,
            boxtone: 770,
            man: 686,
            cel: 611,
            bxx: 915,
            levels: None,
            ipaddr: String::new(),
            netmask: String::new(),
            gateway: String::new(),
            host: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use todtools::TimeValue;

    #[test]
    fn empty_config_is_default() {
        let conf: SysConf = serde_json::from_str("{}").unwrap();
        assert_eq!(conf, SysConf::default());
        assert_eq!(conf.rrs.port, 3601);
        assert_eq!(conf.timy.baudrate, 38400);
        assert_eq!(conf.thbc.udp_port, 2008);
    }

    #[test]
    fn partial_sections() {
        let conf: SysConf = serde_json::from_str(
            r#"{"rrs": {"allowstored": true, "read_timeout": "250ms"},
                "thbc": {"box": 800, "levels": 45}}"#,
        )
        .unwrap();
        assert!(conf.rrs.allowstored);
        assert_eq!(conf.rrs.read_timeout, Duration::from_millis(250));
        assert_eq!(conf.rrs.trigno, "99999");
        assert_eq!(conf.thbc.boxtone, 800);
        assert_eq!(conf.thbc.sta, 514);
        assert_eq!(conf.thbc.levels, Some(45));
    }

    #[test]
    fn channel_delays() {
        let conf: SysConf = serde_json::from_str(
            r#"{"timy": {"chandelay": {"C2": "0.200", "c3m": "1.5", "bogus": "1"}}}"#,
        )
        .unwrap();
        let d = conf.timy.delays();
        assert_eq!(d.len(), 2);
        assert_eq!(d[&2].rawtime(3), "0.200");
        assert_eq!(d[&3].rawtime(1), "1.5");
    }
}
