//! Race Result USB active decoder over a serial line
//!
//! Replies are `;` separated hex fields. A reply opens with a header line
//! naming the request and its status, and ends with an empty line.
//! Passings carry device ticks (1/256 s) which are converted to a time of
//! day through the epoch reference set by [`Rru::sync`](Decoder::sync): the
//! host writes the next whole second with `EPOCHREFSET` and latches it by
//! pulsing DTR at the top of that second.

use crate::cfg::RruConf;
use crate::clock;
use crate::port::{self, Port, Wire};
use crate::{Context, Decoder, Result};
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};
use todtools::chan::id2chan;
use todtools::{Agg, TimeValue, Tod, MICROS, SECS_PER_DAY};
use tracing::{debug, error, info, warn};

const EOL: &str = "\n";
const PASSLEN: usize = 12;
const BEACONLEN: usize = 17;
const LOWBATT: f64 = 2.1;
/// Passing requests between tick count checks
const REFCHECK: u32 = 1800;
/// Two days of ticks
const REFTHRESH: i64 = 0x2a3_0000;
/// Transponder id of trigger impulses
const MARKER: &str = "_____127";
/// Noise ceiling for an acceptable channel, in percent
const MAXNOISE: u32 = 55;
const AUTOBOOT_WAIT: Duration = Duration::from_secs(10);
/// Read timeouts tolerated while a site survey runs
const SURVEY_WAIT: u32 = 30;

/// A documented decoder option
pub struct ConfOpt {
    pub id: &'static str,
    pub label: &'static str,
    /// Applied by `sane` unless configured otherwise
    pub default: Option<&'static str>,
    pub values: &'static [(&'static str, &'static str)],
}

const ONOFF: &[(&str, &str)] = &[("00", "disabled"), ("01", "enabled")];
const IDS: &[(&str, &str)] = &[
    ("00", "1"),
    ("01", "2"),
    ("02", "3"),
    ("03", "4"),
    ("04", "5"),
    ("05", "6"),
    ("06", "7"),
    ("07", "8"),
];

pub const CONFINFO: &[ConfOpt] = &[
    ConfOpt { id: "01", label: "Push Pre-Warn", default: None, values: ONOFF },
    ConfOpt { id: "02", label: "Blink/beep on repeated passing", default: None, values: ONOFF },
    ConfOpt {
        id: "03",
        label: "Impulse input or beep output",
        default: None,
        values: &[("00", "impulse-in"), ("01", "beep-out")],
    },
    // USB power is unreliable
    ConfOpt { id: "04", label: "Auto-shutdown on power loss", default: Some("00"), values: ONOFF },
    ConfOpt {
        id: "05",
        label: "Operation Mode",
        default: Some("06"),
        values: &[("05", "usb-kiosk"), ("06", "usb-timing"), ("07", "usb-store&copy")],
    },
    ConfOpt { id: "06", label: "Channel ID", default: None, values: IDS },
    ConfOpt { id: "07", label: "Loop ID", default: None, values: IDS },
    ConfOpt { id: "08", label: "Loop Power", default: None, values: &[] },
    ConfOpt { id: "09", label: "Blink dead-time", default: None, values: &[] },
    ConfOpt { id: "0a", label: "Charging via USB", default: None, values: ONOFF },
    ConfOpt { id: "0b", label: "Use DTR", default: Some("01"), values: ONOFF },
    ConfOpt {
        id: "0c",
        label: "Alternate Channel Switching",
        default: None,
        values: &[("00", "disabled"), ("01", "automatic"), ("02", "force")],
    },
    ConfOpt {
        id: "0d",
        label: "Box Mode",
        default: None,
        values: &[
            ("31", "check"),
            ("32", "deep-sleep"),
            ("33", "health-check"),
            ("34", "tracking"),
            ("41", "usb-timing"),
        ],
    },
    ConfOpt { id: "a0", label: "Tray Scan Power", default: None, values: &[] },
    ConfOpt { id: "a1", label: "Tray Scan interval", default: None, values: &[] },
    ConfOpt { id: "a2", label: "Tray Scan ramp up delay", default: None, values: &[] },
    ConfOpt { id: "a3", label: "Tray Scan row to column delay", default: None, values: &[] },
    ConfOpt {
        id: "a4",
        label: "Repeat Row and Column cycle for another N repetition",
        default: None,
        values: &[],
    },
    ConfOpt { id: "b1", label: "CheckSum", default: None, values: &[("0", "disabled"), ("1", "enabled")] },
    ConfOpt {
        id: "b2",
        label: "Push Passings",
        default: None,
        values: &[("0", "disabled"), ("1", "enabled")],
    },
];

/// Box mode goes before impulse input, channel id is set last
const SETORDER: [&str; 19] = [
    "05", "01", "02", "04", "07", "08", "09", "0a", "0b", "0c", "0d", "a0", "a1", "a2", "a3",
    "a4", "b1", "b2", "03",
];

const INFOLBLS: &[(&str, &str)] = &[
    ("01", "Decoder ID"),
    ("02", "Firmware Major Version"),
    ("03", "Hardware Version"),
    ("04", "Box Type"),
    ("05", "Battery Voltage"),
    ("07", "Battery State"),
    ("08", "Battery Level"),
    ("09", "Internal Temperature"),
    ("0a", "Supply Voltage"),
    ("0b", "Loop Status"),
    ("0c", "Firmware Minor Version"),
];
const BOX_TYPES: &[(&str, &str)] =
    &[("0a", "active-ext"), ("1e", "management-box"), ("28", "usb-timing-box")];
const BATTERY_STATES: &[(&str, &str)] = &[
    ("00", "Fault"),
    ("01", "Charging"),
    ("02", "Reduced Charging"),
    ("03", "Discharging"),
];
const LOOP_STATES: &[(&str, &str)] =
    &[("00", "OK"), ("01", "Fault"), ("02", "Limit"), ("03", "Overvoltage Error")];

fn lookup(table: &[(&'static str, &'static str)], key: &str) -> Option<&'static str> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

fn confopt(id: &str) -> Option<&'static ConfOpt> {
    CONFINFO.iter().find(|o| o.id == id)
}

fn hex(val: &str) -> Option<i64> {
    i64::from_str_radix(val.trim(), 16).ok()
}

/// Multi-line reply currently being received
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Reply {
    Ascii,
    ConfSet,
    ConfGet,
    InfoGet,
    SiteSurvey,
    TimestampGet,
    EpochRefGet,
    EpochRefSet,
    EpochRefAdj,
    PassingGet,
    PassingIdError,
    PassingInfoGet,
    BeaconGet,
    Prewarn,
}

impl Reply {
    fn from_header(head: &str) -> Option<Reply> {
        let r = match head {
            "ASCII" => Reply::Ascii,
            "CONFSET" => Reply::ConfSet,
            "CONFGET" => Reply::ConfGet,
            "INFOGET" => Reply::InfoGet,
            "SITESURVEY" => Reply::SiteSurvey,
            "TIMESTAMPGET" => Reply::TimestampGet,
            "EPOCHREFGET" => Reply::EpochRefGet,
            "EPOCHREFSET" => Reply::EpochRefSet,
            "EPOCHREFADJ1D" => Reply::EpochRefAdj,
            "PASSINGGET" => Reply::PassingGet,
            "PASSINGINFOGET" => Reply::PassingInfoGet,
            "BEACONGET" => Reply::BeaconGet,
            "PREWARN" => Reply::Prewarn,
            _ => return None,
        };
        Some(r)
    }
}

enum Line {
    Text(String),
    /// Empty line closing a reply
    End,
}

/// Convert device ticks to a time of day through an epoch reference
///
/// `ref_ticks` is the tick count at the moment the device clock read
/// `ref_tod`. The result wraps at midnight.
pub fn tick_to_tod(ticks: i64, ref_ticks: i64, ref_tod: &impl TimeValue) -> Option<Tod> {
    let elapsed = ((ticks - ref_ticks) as i128 * MICROS as i128).div_euclid(256) as i64;
    let us = (ref_tod.micros() + elapsed).rem_euclid(SECS_PER_DAY * MICROS);
    Tod::from_micros(us).ok()
}

/// Pick the quietest channel under the noise ceiling, ties broken at random
pub fn select_channel(noise: &BTreeMap<u8, u32>) -> Option<(u8, u32)> {
    let mut chans: Vec<(u8, u32)> = noise.iter().map(|(&c, &n)| (c, n)).collect();
    chans.shuffle(&mut rand::thread_rng());
    let mut best = None;
    let mut cv = MAXNOISE;
    for (c, n) in chans {
        if n < cv {
            best = Some((c, n));
            cv = n;
        }
    }
    return best;
}

/// Desired option values: configured by label, else the option default
pub fn desired_config(cfg: &RruConf) -> BTreeMap<&'static str, String> {
    let mut ret = BTreeMap::new();
    for opt in CONFINFO {
        match cfg.decoderconfig.get(opt.label) {
            Some(v) => {
                debug!("set {}: {}", opt.label, lookup(opt.values, v).unwrap_or(v));
                ret.insert(opt.id, v.clone());
            }
            None => {
                if let Some(d) = opt.default {
                    ret.insert(opt.id, d.to_string());
                }
            }
        }
    }
    return ret;
}

pub struct Rru {
    cfg: RruConf,
    wire: Option<Wire>,
    rdbuf: Vec<u8>,
    curport: Option<String>,
    config: BTreeMap<&'static str, String>,
    boxname: Option<String>,
    /// Tick count and time of day of the epoch reference
    epoch: Option<(i64, Agg)>,
    curreply: Option<Reply>,
    lastpassing: u64,
    lastrequest: Option<u64>,
    request_pending: bool,
    autochannel: Option<String>,
    refcount: u32,
    sitenoise: BTreeMap<u8, u32>,
}

impl Rru {
    pub fn new(cfg: RruConf) -> Rru {
        Rru {
            cfg,
            wire: None,
            rdbuf: Vec::new(),
            curport: None,
            config: BTreeMap::new(),
            boxname: None,
            epoch: None,
            curreply: None,
            lastpassing: 0,
            lastrequest: None,
            request_pending: false,
            autochannel: None,
            refcount: 0,
            sitenoise: (1..=8).map(|c| (c, 100)).collect(),
        }
    }

    fn open(&mut self, ctx: &Context, port: Box<dyn Port>) -> Result<()> {
        self.request_pending = false;
        self.epoch = None;
        self.curreply = None;
        self.rdbuf.clear();
        self.wire = Some(Wire::new(port));
        self.sane(ctx)
    }

    fn send(&mut self, msg: &str) -> Result<()> {
        if let Some(w) = self.wire.as_mut() {
            w.send(&port::encode(&format!("{}{}", msg, EOL)))?;
        }
        Ok(())
    }

    fn readline(&mut self) -> Result<Option<Line>> {
        loop {
            let next = match self.wire.as_mut() {
                Some(w) => w.read_byte()?,
                None => return Ok(None),
            };
            match next {
                None => return Ok(None),
                Some(b'\n') => {
                    let raw = std::mem::take(&mut self.rdbuf);
                    let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
                    let text = port::decode(&raw[start..]);
                    let text = text.trim_end_matches('\r');
                    if text.is_empty() {
                        return Ok(Some(Line::End));
                    }
                    return Ok(Some(Line::Text(text.to_string())));
                }
                Some(b) => self.rdbuf.push(b),
            }
        }
    }

    fn tstotod(&self, ts: &str) -> Option<Tod> {
        match (self.epoch.as_ref(), hex(ts)) {
            (Some((stamp, reftod)), Some(ticks)) => tick_to_tod(ticks, *stamp, reftod),
            (None, _) => {
                error!("no epoch reference to convert {:?}", ts);
                None
            }
            (_, None) => {
                error!("invalid timestamp {:?}", ts);
                None
            }
        }
    }

    fn confmsg(&mut self, cid: &str, val: &str) -> Result<()> {
        let opt = confopt(cid);
        let lbl = opt.map_or(cid, |o| o.label);
        let vbl = match cid {
            "08" => hex(val).map_or(val.to_string(), |v| format!("{}%", v)),
            "07" => hex(val).map_or(val.to_string(), |v| (v + 1).to_string()),
            _ => opt
                .and_then(|o| lookup(o.values, val))
                .unwrap_or(val)
                .to_string(),
        };
        match self.config.get(cid).cloned() {
            Some(want) => {
                if val != want && !want.eq_ignore_ascii_case("auto") {
                    if self.curreply == Some(Reply::ConfSet) {
                        error!("error setting config {}, desired:{:?} actual:{:?}", lbl, want, val);
                    } else {
                        info!("updating config {}: {} => {}", lbl, val, want);
                        self.send(&format!("CONFSET;{};{}", cid, want))?;
                    }
                } else {
                    info!("config {}: {}", lbl, vbl);
                }
            }
            None if cid == "07" || cid == "08" => info!("config {}: {}", lbl, vbl),
            None => debug!("config {}: {}", lbl, vbl),
        }
        Ok(())
    }

    fn infomsg(&mut self, pid: &str, val: &str) {
        let lbl = match lookup(INFOLBLS, pid) {
            Some(l) => l,
            None => {
                info!("info [undocumented] {}: {}", pid, val);
                return;
            }
        };
        let tenths = |v: &str| hex(v).map(|n| format!("{:.1}", n as f64 / 10.0));
        let vbl = match pid {
            "01" => {
                let name = hex(val).map(|n| format!("A-{}", n));
                if let Some(n) = name.as_ref() {
                    self.boxname = Some(n.clone());
                }
                name
            }
            "02" | "03" => tenths(val).map(|v| format!("v{}", v)),
            "04" => lookup(BOX_TYPES, val).map(String::from),
            "05" | "0a" => tenths(val).map(|v| format!("{}V", v)),
            "07" => lookup(BATTERY_STATES, val).map(String::from),
            "08" => hex(val).map(|n| format!("{}%", n)),
            "09" => hex(val).map(|n| format!("{}\u{b0}C", n)),
            "0b" => lookup(LOOP_STATES, val).map(String::from),
            _ => None,
        };
        info!("info {}: {}", lbl, vbl.as_deref().unwrap_or(val));
    }

    fn refgetmsg(&mut self, epoch: &str, stime: &str) {
        match (hex(epoch), hex(stime)) {
            (Some(e), Some(s)) => {
                let reftod = Agg::from_secs(e);
                debug!("reference ticks: {} @ {}", s, reftod.rawtime(4));
                self.epoch = Some((s, reftod));
            }
            _ => error!("invalid epoch reference {:?};{:?}", epoch, stime),
        }
    }

    fn timestampchk(&mut self, ticks: &str) -> Result<()> {
        if let Some(tcnt) = hex(ticks) {
            info!("box tick count: {}", tcnt);
            if tcnt > REFTHRESH {
                info!("tick threshold exceeded, adjusting ref");
                self.send("EPOCHREFADJ1D")?;
            }
        }
        Ok(())
    }

    fn passinginfomsg(&mut self, mv: &[&str]) {
        if mv.len() != 5 {
            debug!("non-passinginfo message: {:?}", mv);
            return;
        }
        match hex(mv[0]) {
            Some(n) if n > 0 => {
                let first = hex(mv[1]).unwrap_or(0);
                let last = hex(mv[3]).unwrap_or(0);
                let ftime = self.tstotod(mv[2]).map(|t| t.rawtime(2)).unwrap_or_default();
                let ltime = self.tstotod(mv[4]).map(|t| t.rawtime(2)).unwrap_or_default();
                info!("info {} passings, {}@{} - {}@{}", n, first, ftime, last, ltime);
                if last >= 0 && (last as u64) + 1 < self.lastpassing {
                    warn!(
                        "decoder memory/id mismatch last={}, req={}, clear/sync required",
                        last, self.lastpassing
                    );
                    self.lastpassing = last as u64 + 1;
                }
            }
            _ => info!("info no passings"),
        }
    }

    fn passingmsg(&mut self, ctx: &Context, mv: &[&str]) {
        if mv.len() == PASSLEN {
            // the usb decoder has no passing id, count them here
            let istr = self.lastpassing.to_string();
            let timestr = mv[2];
            let (hits, rssi, battery) = (mv[3], mv[4], mv[5]);
            let loopid = match hex(mv[8]) {
                Some(l) if l >= 0 => id2chan((l + 1).min(u8::MAX as i64) as u8),
                _ => String::from("C1"),
            };
            let activestore = hex(mv[10]).map_or(false, |v| v & 0x40 == 0x40);
            let tagid = if mv[0] == MARKER { "" } else { mv[0] };

            if !battery.is_empty() && !tagid.is_empty() {
                if let Some(bv) = hex(battery).map(|b| b as f64 / 10.0) {
                    if bv < LOWBATT {
                        warn!("low battery {}: {:.1}V", tagid, bv);
                    }
                }
            }
            if !tagid.is_empty() {
                if let (Some(h), Some(r)) = (hex(hits), hex(rssi)) {
                    if let Some((twofour, lstrength)) = crate::rrs::poor_read(h as u32, r as u32, 4, 5)
                    {
                        warn!(
                            "poor read {}: hits:{} rssi:{}dBm loop:{}dB",
                            tagid, h, twofour, lstrength
                        );
                    }
                }
            }

            debug!(target: "passing", "{}", mv.join(";"));

            if let Some(t) = self.tstotod(timestr) {
                let source = self.boxname.clone().unwrap_or_default();
                let t = t.tagged(&istr, &loopid, tagid, &source);
                if !activestore || self.cfg.allowstored {
                    ctx.emit(t);
                } else {
                    debug!("stored passing {} not reported", istr);
                }
            }
            self.lastpassing += 1;
        } else if mv.len() == 2 {
            let resp = hex(mv[0]);
            let rcount = hex(mv[1]).unwrap_or(0);
            if resp.map(|r| r as u64) != self.lastrequest {
                error!("sequence mismatch request: {:?}, response: {:?}", self.lastrequest, resp);
                self.lastpassing = 0;
            } else if rcount > 0 {
                debug!("receiving {} passings", rcount);
            }
        } else {
            debug!("non-passing message: {:?}", mv);
        }
    }

    fn beaconmsg(&self, mv: &[&str]) {
        if mv.len() == BEACONLEN {
            let chid = hex(mv[5]).unwrap_or(0) + 1;
            let noise = 10 * hex(mv[12]).unwrap_or(0);
            let lqi = hex(mv[13]).unwrap_or(0) as f64 / 2.56;
            let rssi = -90 + hex(mv[14]).unwrap_or(0);
            info!("info ch {} noise: {}%", chid, noise);
            info!("info avg lqi: {:.0}%", lqi);
            info!("info avg rssi: {}dBm", rssi);
        } else if mv.len() == 1 {
            debug!("receiving {:?} beacons", hex(mv[0]));
        } else {
            debug!("non-beacon message: {:?}", mv);
        }
    }

    fn idupdate(&mut self, reqid: &str, minid: &str) {
        let (resp, newid) = match (hex(reqid), hex(minid)) {
            (Some(r), Some(n)) if r >= 0 && n >= 0 => (r as u64, n as u64),
            _ => return,
        };
        if Some(resp) != self.lastrequest {
            error!(
                "id mismatch: request={:?}, response={}:{}, reset to first passing",
                self.lastrequest, resp, newid
            );
            self.lastpassing = newid;
        } else if resp < newid {
            warn!("data loss: {} passings not received", newid - resp);
            self.lastpassing = newid;
        }
    }

    fn surveymsg(&mut self, chan: &str, noise: &str) {
        let channo = hex(chan).map(|c| c + 1);
        match (channo, hex(noise)) {
            (Some(c), Some(n)) if (1..=8).contains(&c) => {
                self.sitenoise.insert(c as u8, 10 * n.max(0) as u32);
            }
            _ => debug!("unknown channel in site survey: {:?}", chan),
        }
    }

    fn chansurf(&mut self) -> Result<()> {
        let survey: Vec<String> = self
            .sitenoise
            .iter()
            .map(|(c, n)| format!("{}:{}%", c, n))
            .collect();
        debug!("site survey: {}", survey.join(" "));
        match select_channel(&self.sitenoise) {
            Some((ch, nv)) => {
                info!("selected channel {} ({}%)", ch, nv);
                let sv = format!("{:02x}", ch - 1);
                self.send(&format!("CONFSET;06;{}", sv))?;
                self.autochannel = Some(sv);
            }
            None => warn!("unable to find a suitable channel"),
        }
        Ok(())
    }

    fn handlereply(&mut self, ctx: &Context, reply: Reply, mv: &[&str]) -> Result<()> {
        match (reply, mv.len()) {
            (Reply::PassingGet, _) => self.passingmsg(ctx, mv),
            (Reply::PassingInfoGet, _) => self.passinginfomsg(mv),
            (Reply::PassingIdError, 2) => self.idupdate(mv[0], mv[1]),
            (Reply::InfoGet, 2) => self.infomsg(mv[0], mv[1]),
            (Reply::EpochRefGet | Reply::EpochRefSet | Reply::EpochRefAdj, 2) => {
                self.refgetmsg(mv[0], mv[1])
            }
            (Reply::ConfGet | Reply::ConfSet, 2) => self.confmsg(mv[0], mv[1])?,
            (Reply::TimestampGet, 1) => self.timestampchk(mv[0])?,
            (Reply::SiteSurvey, 2) => self.surveymsg(mv[0], mv[1]),
            (Reply::BeaconGet, _) => self.beaconmsg(mv),
            _ => debug!("{:?} : {:?}", reply, mv),
        }
        Ok(())
    }

    fn procline(&mut self, ctx: &Context, line: &Line) -> Result<()> {
        let text = match line {
            Line::End => {
                match self.curreply {
                    Some(Reply::PassingGet | Reply::PassingIdError) => self.request_pending = false,
                    Some(Reply::SiteSurvey) => self.chansurf()?,
                    _ => {}
                }
                self.curreply = None;
                return Ok(());
            }
            Line::Text(t) => t,
        };
        let mv: Vec<&str> = text.split(';').collect();
        if mv[0] == "#P" {
            // pushed passings bypass the reply state
            self.passingmsg(ctx, &mv[1..]);
        } else if mv[0] == "PREWARN" {
            self.curreply = Some(Reply::Prewarn);
        } else if let Some(reply) = Reply::from_header(mv[0]) {
            if let Some(cur) = self.curreply {
                debug!("protocol error: {:?} not terminated", cur);
            }
            self.curreply = Some(reply);
            let status = mv.get(1).copied().unwrap_or("00");
            if status != "00" {
                if reply == Reply::PassingGet && status == "10" {
                    self.curreply = Some(Reply::PassingIdError);
                } else {
                    debug!("{:?} error: {:?}", reply, status);
                }
            }
        } else if let Some(reply) = self.curreply {
            self.handlereply(ctx, reply, &mv)?;
        }
        Ok(())
    }

    fn request_next(&mut self) -> Result<()> {
        if self.epoch.is_some() && !self.request_pending {
            self.request_pending = true;
            self.lastrequest = Some(self.lastpassing);
            self.send(&format!("PASSINGGET;{:08x}", self.lastpassing))?;
            self.refcount += 1;
            if self.refcount > REFCHECK {
                self.send("TIMESTAMPGET")?;
                self.refcount = 0;
            }
        }
        Ok(())
    }
}

impl Decoder for Rru {
    fn name(&self) -> &str {
        "rru"
    }

    fn connected(&self) -> bool {
        self.boxname.is_some() && self.wire.is_some()
    }

    fn is_open(&self) -> bool {
        self.wire.is_some()
    }

    fn connect(&mut self, ctx: &Context, addr: Option<&str>) -> Result<()> {
        self.close();
        let addr = match addr.map(String::from).or_else(|| self.curport.clone()) {
            Some(a) => a,
            None => {
                debug!("re-connect cancelled: no port");
                return Ok(());
            }
        };
        let serial = port::serial(&addr, self.cfg.baudrate, false, self.cfg.read_timeout)?;
        self.curport = Some(addr);
        self.open(ctx, serial)
    }

    fn attach(&mut self, ctx: &Context, port: Box<dyn Port>) -> Result<()> {
        self.close();
        self.open(ctx, port)
    }

    fn close(&mut self) {
        self.boxname = None;
        if let Some(w) = self.wire.take() {
            debug!("close connection");
            w.close();
        }
    }

    fn read(&mut self, ctx: &Context) -> Result<()> {
        let mut refetch = false;
        let mut idle = 0;
        loop {
            match self.readline()? {
                None => {
                    // a site survey runs for several seconds
                    idle += 1;
                    if self.curreply != Some(Reply::SiteSurvey) || idle > SURVEY_WAIT {
                        refetch = true;
                        break;
                    }
                }
                Some(line) => {
                    self.procline(ctx, &line)?;
                    if self.curreply == Some(Reply::Prewarn) {
                        refetch = true;
                    }
                    if matches!(line, Line::End) {
                        break;
                    }
                }
            }
        }
        if refetch {
            self.request_next()?;
        }
        Ok(())
    }

    fn sane(&mut self, _ctx: &Context) -> Result<()> {
        info!("allow stored passings: {}", self.cfg.allowstored);
        self.config = desired_config(&self.cfg);
        // keep a channel chosen by site survey
        if let Some(ch) = self.autochannel.clone() {
            self.config.insert("06", ch);
        }

        self.send("ASCII")?;
        self.send("INFOGET;01")?;
        for opt in SETORDER {
            if let Some(v) = self.config.get(opt).cloned() {
                self.send(&format!("CONFSET;{};{}", opt, v))?;
            }
        }
        if let Some(ch) = self.config.get("06").cloned() {
            if ch.eq_ignore_ascii_case("auto") {
                info!("performing site survey to set channel id");
                self.send("SITESURVEY")?;
            } else {
                self.send(&format!("CONFSET;06;{}", ch))?;
            }
        }
        self.send("EPOCHREFGET")?;
        self.send("TIMESTAMPGET")?;
        self.send("CONFGET;07")?;
        self.send("PASSINGINFOGET")
    }

    fn sync(&mut self, _ctx: &Context) -> Result<()> {
        debug!("performing blocking dtr sync");
        self.epoch = None;
        let mut nt = Tod::now();
        let frac = (&nt - &nt.truncate(0)).micros();
        if frac < MICROS / 10 || frac > 9 * MICROS / 10 {
            debug!("sleeping 0.3s");
            thread::sleep(Duration::from_millis(300));
            nt = Tod::now();
        }
        let ett = clock::next_second(&nt);
        debug!("host reference time: {}", ett.rawtime(0));
        self.send(&format!("EPOCHREFSET;{:08x}", ett.micros() / MICROS))?;
        clock::wait_for(&ett);
        if let Some(w) = self.wire.as_mut() {
            debug!("set dtr");
            w.set_dtr(true)?;
            thread::sleep(Duration::from_millis(200));
            debug!("clear dtr");
            w.set_dtr(false)?;
        }
        Ok(())
    }

    fn start_session(&mut self, ctx: &Context) -> Result<()> {
        // the session is always running, start over from a reset unit
        self.clear(ctx)?;
        info!("start session");
        Ok(())
    }

    fn stop_session(&mut self, _ctx: &Context) -> Result<()> {
        // passings are kept on the unit and fetched after the next sync
        self.epoch = None;
        info!("stop session");
        Ok(())
    }

    fn status(&mut self, _ctx: &Context) -> Result<()> {
        let mut ids: Vec<&str> = CONFINFO.iter().map(|o| o.id).collect();
        ids.sort_unstable();
        for id in ids {
            self.send(&format!("CONFGET;{}", id))?;
        }
        for (id, _) in INFOLBLS {
            self.send(&format!("INFOGET;{}", id))?;
        }
        self.send("BEACONGET")?;
        self.send("PASSINGINFOGET")?;
        self.send("TIMESTAMPGET")
    }

    fn clear(&mut self, ctx: &Context) -> Result<()> {
        debug!("performing box reset");
        self.boxname = None;
        self.send("RESET")?;
        let deadline = Instant::now() + AUTOBOOT_WAIT;
        loop {
            if Instant::now() > deadline {
                warn!("no AUTOBOOT from decoder after reset");
                break;
            }
            match self.readline()? {
                Some(Line::Text(l)) if l == "AUTOBOOT" => break,
                _ => {}
            }
            if self.wire.is_none() {
                break;
            }
        }
        self.epoch = None;
        self.curreply = None;
        self.lastrequest = Some(0);
        self.lastpassing = 0;
        self.request_pending = false;
        self.sane(ctx)?;
        self.sync(ctx)
    }

    fn write(&mut self, _ctx: &Context, msg: &[u8]) -> Result<()> {
        let msg = port::decode(msg);
        self.send(msg.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_table_ids() {
        assert_eq!(CONFINFO.len(), 20);
        for id in SETORDER {
            assert!(confopt(id).is_some(), "{}", id);
        }
        assert!(!SETORDER.contains(&"06"));
        assert_eq!(confopt("0b").unwrap().default, Some("01"));
    }

    #[test]
    fn reply_headers() {
        assert_eq!(Reply::from_header("EPOCHREFADJ1D"), Some(Reply::EpochRefAdj));
        assert_eq!(Reply::from_header("PASSINGGET"), Some(Reply::PassingGet));
        assert_eq!(Reply::from_header("AUTOBOOT"), None);
    }

    #[test]
    fn lookups() {
        assert_eq!(lookup(BOX_TYPES, "28"), Some("usb-timing-box"));
        assert_eq!(lookup(LOOP_STATES, "09"), None);
        assert_eq!(hex("1e"), Some(30));
        assert_eq!(hex("zz"), None);
    }
}
