use anyhow::{anyhow, bail};
use argh::FromArgs;
use decoder::cfg::SysConf;
use decoder::rrs::Rrs;
use decoder::rru::Rru;
use decoder::thbc::Thbc;
use decoder::timy::{Arming, Timy};
use decoder::DecoderHandle;
use std::fmt;
use std::str::FromStr;
use todtools::{TimeValue, Tod};
use tracing::{info, warn};

#[derive(Debug, FromArgs, Clone)]
/// Connect to a race timing decoder and print accepted passings to
/// standard output, one per line. Commands for the decoder are read from
/// standard input, one per line: sane, sync, start, stop, status, clear,
/// replay FILE, arm CHAN, dearm CHAN, trig CHAN, write MSG, port [ADDR]
/// and quit.
pub struct CliArgs {
    /// print version information
    #[argh(switch, short = 'v')]
    pub version: bool,
    /// decoder kind: timy, rrs, rru or thbc
    #[argh(positional)]
    pub kind: Option<Kind>,
    /// serial device or network address
    #[argh(option, short = 'p')]
    pub port: Option<String>,
    /// system config file path
    #[argh(option)]
    pub config: Option<String>,
    /// reset the decoder configuration after connecting
    #[argh(switch)]
    pub sane: bool,
    /// set the decoder clock after connecting
    #[argh(switch)]
    pub sync: bool,
    /// arm a timy channel, may be repeated
    #[argh(option)]
    pub arm: Vec<String>,
    /// keep timy channels armed after an impulse
    #[argh(switch)]
    pub armlock: bool,
    /// stop after this many seconds
    #[argh(option)]
    pub duration: Option<u64>,
    /// print passings as json
    #[argh(switch)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Timy,
    Rrs,
    Rru,
    Thbc,
}

impl FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> Result<Kind, String> {
        match s.to_ascii_lowercase().as_str() {
            "timy" => Ok(Kind::Timy),
            "rrs" => Ok(Kind::Rrs),
            "rru" => Ok(Kind::Rru),
            "thbc" => Ok(Kind::Thbc),
            _ => Err(format!("unknown decoder kind {:?}", s)),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Timy => "timy",
            Kind::Rrs => "rrs",
            Kind::Rru => "rru",
            Kind::Thbc => "thbc",
        };
        f.write_str(name)
    }
}

/// A running decoder, with channel arming for a Timy
pub struct Device {
    pub handle: DecoderHandle,
    pub arming: Option<Arming>,
}

/// Start the device thread for `kind`, nothing is connected yet
pub fn start(kind: Kind, conf: &SysConf) -> decoder::Result<Device> {
    info!("starting {} decoder", kind);
    let device = match kind {
        Kind::Timy => {
            let timy = Timy::new(conf.timy.clone());
            let arming = timy.arming();
            Device {
                handle: DecoderHandle::start(timy)?,
                arming: Some(arming),
            }
        }
        Kind::Rrs => Device {
            handle: DecoderHandle::start(Rrs::new(conf.rrs.clone()))?,
            arming: None,
        },
        Kind::Rru => Device {
            handle: DecoderHandle::start(Rru::new(conf.rru.clone()))?,
            arming: None,
        },
        Kind::Thbc => Device {
            handle: DecoderHandle::start(Thbc::new(conf.thbc.clone()))?,
            arming: None,
        },
    };
    Ok(device)
}

/// One line of operator input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Sane,
    Sync,
    Start,
    Stop,
    Status,
    Clear,
    Replay(String),
    Arm(String),
    Dearm(String),
    Trig(String),
    Write(String),
    Port(Option<String>),
    Quit,
}

impl FromStr for Request {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> anyhow::Result<Request> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((w, r)) => (w, r.trim()),
            None => (line, ""),
        };
        let arg = || {
            if rest.is_empty() {
                Err(anyhow!("{} needs an argument", word))
            } else {
                Ok(rest.to_string())
            }
        };
        let req = match word.to_ascii_lowercase().as_str() {
            "sane" => Request::Sane,
            "sync" => Request::Sync,
            "start" => Request::Start,
            "stop" => Request::Stop,
            "status" => Request::Status,
            "clear" => Request::Clear,
            "replay" => Request::Replay(rest.to_string()),
            "arm" => Request::Arm(arg()?),
            "dearm" => Request::Dearm(arg()?),
            "trig" => Request::Trig(arg()?),
            "write" => Request::Write(arg()?),
            "port" if rest.is_empty() => Request::Port(None),
            "port" => Request::Port(Some(rest.to_string())),
            "quit" | "exit" => Request::Quit,
            "" => bail!("empty request"),
            _ => bail!("unknown request {:?}", word),
        };
        Ok(req)
    }
}

impl Device {
    /// Queue `req` on the device, false once the operator asked to quit
    pub fn apply(&self, req: &Request) -> bool {
        let h = &self.handle;
        match req {
            Request::Sane => h.sane(),
            Request::Sync => h.sync(),
            Request::Start => h.start_session(),
            Request::Stop => h.stop_session(),
            Request::Status => h.status(),
            Request::Clear => h.clear(),
            Request::Replay(file) => h.replay(file),
            Request::Arm(chan) | Request::Dearm(chan) => match self.arming.as_ref() {
                Some(a) => {
                    let ok = if matches!(req, Request::Arm(_)) { a.arm(chan) } else { a.dearm(chan) };
                    if !ok {
                        warn!("unknown channel {:?}", chan);
                    }
                }
                None => warn!("{} has no channel arming", h.name()),
            },
            Request::Trig(chan) => h.trig(Tod::now().tagged("", chan, "", "manual")),
            Request::Write(msg) => h.write(msg.as_str()),
            Request::Port(addr) => h.setport(addr.as_deref()),
            Request::Quit => return false,
        }
        true
    }
}

/// Tab separated passing: index, channel, transponder, time, source
pub fn passing_line(t: &Tod) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}",
        t.index,
        t.chan,
        t.refid,
        t.rawtime(4),
        t.source
    )
}
