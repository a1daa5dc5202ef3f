//! Tag Heuer / Chronelec Protime decoder over serial or UDP
//!
//! Messages from the decoder end with CR LF and are told apart by their
//! first byte: `<` passing, `[` status and `+++` configuration dump.
//! Passings carry a four digit decimal sum of their 32 byte payload and
//! are acknowledged once accepted. Configuration writes use the "V3"
//! framing: `ESC`, payload, MCRF4XX CRC-16 (high byte first), `>`.

use crate::cfg::ThbcConf;
use crate::clock;
use crate::handle::DecoderHandle;
use crate::port::{self, Dgram, Port, Wire};
use crate::{Command, Context, Decoder, Result};
use chrono::{Datelike, Local, NaiveDate};
use std::net::{Ipv4Addr, ToSocketAddrs};
use std::thread;
use std::time::Duration;
use todtools::{mktod, TimeValue, Tod, MICROS};
use tracing::{debug, error, info, warn};

pub const ESCAPE: u8 = 0x1b;
pub const STOPCMD: &[u8] = b"\x1b\x13\x5c";
pub const ACKCMD: &[u8] = b"\x1b\x11";
pub const STATCMD: &[u8] = b"\x1b\x05";
pub const STARTCMD: &[u8] = b"\x1b\x07";
/// Request a configuration dump
pub const QUECMD: &[u8] = b"\x1b\x10";
const STALVL: &[u8] = b"\x1b\x1e";
const BOXLVL: &[u8] = b"\x1b\x1f";
const SETTIME: [u8; 2] = [ESCAPE, 0x48];
const CR: u8 = 0x0d;
const LF: u8 = 0x0a;
/// Reply to an IP configuration write
const IPDONE: &[u8] = b"\x1e\x86\x98";
const IPWAIT: Duration = Duration::from_secs(10);
/// Consecutive checksum failures before acknowledging anyway
const MAXCKSUMERR: u32 = 3;

pub const CONFIG_LEN: usize = 27;
const CONFIG_TOD: usize = 0;
const CONFIG_GPS: usize = 1;
const CONFIG_TZ_HOUR: usize = 2;
const CONFIG_TZ_MIN: usize = 3;
const CONFIG_485: usize = 4;
const CONFIG_FIBRE: usize = 5;
const CONFIG_PRINT: usize = 6;
const CONFIG_MAX: usize = 7;
const CONFIG_PROT: usize = 8;
const CONFIG_PULSE: usize = 9;
const CONFIG_PULSEINT: usize = 10;
const CONFIG_CELLSYNC: usize = 11;
const CONFIG_CELLTOD_HOUR: usize = 12;
const CONFIG_CELLTOD_MIN: usize = 13;
const CONFIG_ACTIVE_LOOP: usize = 14;
/// Tone offsets, two bytes each: STA, BOX, MAN, CEL, BXX
const CONFIG_TONES: [usize; 5] = [15, 17, 19, 21, 23];
const CONFIG_SPARE: usize = 25;

const MCRF4XX: [u16; 256] = crc_table();

const fn crc_table() -> [u16; 256] {
    let mut tbl = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut r = i as u16;
        let mut j = 0;
        while j < 8 {
            r = if r & 1 != 0 { (r >> 1) ^ 0x8408 } else { r >> 1 };
            j += 1;
        }
        tbl[i] = r;
        i += 1;
    }
    tbl
}

/// MCRF4XX CRC-16 of `msg`
pub fn mcrf4xx(msg: &[u8]) -> u16 {
    let mut r: u16 = 0xffff;
    for &b in msg {
        r = (r >> 8) ^ MCRF4XX[((r ^ b as u16) & 0xff) as usize];
    }
    return r;
}

/// Four digit decimal sum of the byte values in `msg`
pub fn thbc_sum(msg: &[u8]) -> [u8; 4] {
    let total: u32 = msg.iter().map(|&b| b as u32).sum();
    let mut ret = [b'0'; 4];
    ret.copy_from_slice(format!("{:04}", total % 10000).as_bytes());
    return ret;
}

/// Two decimal digits packed as nibbles, 97 -> 0x97
pub fn val2hexval(val: u32) -> u8 {
    ((((val / 10) & 0x0f) << 4) | ((val % 10) & 0x0f)) as u8
}

pub fn hexval2val(hexval: u8) -> u32 {
    10 * (hexval >> 4) as u32 + (hexval & 0x0f) as u32
}

/// Wrap a payload in V3 command framing
pub fn v3_frame(payload: &[u8]) -> Vec<u8> {
    let crc = mcrf4xx(payload);
    let mut ret = Vec::with_capacity(payload.len() + 4);
    ret.push(ESCAPE);
    ret.extend_from_slice(payload);
    ret.extend_from_slice(&crc.to_be_bytes());
    ret.push(b'>');
    return ret;
}

fn ipv4(name: &str) -> Option<Ipv4Addr> {
    if let Ok(ip) = name.parse::<Ipv4Addr>() {
        return Some(ip);
    }
    (name, 0).to_socket_addrs().ok()?.find_map(|a| match a.ip() {
        std::net::IpAddr::V4(ip) => Some(ip),
        _ => None,
    })
}

/// V3 frame writing the decoder's IP address, netmask, gateway and host
///
/// Names that do not resolve are written as `0.0.0.0`.
pub fn ipconfig_frame(cfg: &ThbcConf) -> Vec<u8> {
    let mut cmd = vec![0x09, 0x09];
    for (opt, name) in [
        ("ipaddr", &cfg.ipaddr),
        ("netmask", &cfg.netmask),
        ("gateway", &cfg.gateway),
        ("host", &cfg.host),
    ] {
        let ip = match ipv4(name) {
            Some(ip) => {
                debug!("ip config {}: {}", opt, ip);
                ip
            }
            None => {
                info!("ip config {}: unable to resolve {:?}", opt, name);
                Ipv4Addr::UNSPECIFIED
            }
        };
        cmd.extend_from_slice(&ip.octets());
    }
    v3_frame(&cmd)
}

/// V3 frame setting the decoder date, years counted from 2000
pub fn set_date_cmd(date: &NaiveDate) -> Vec<u8> {
    let year = (date.year() - 2000).rem_euclid(256) as u8;
    v3_frame(&[0x0a, 0x0a, date.day() as u8, date.month() as u8, year])
}

/// Set time of day command, to whole seconds
pub fn set_time_cmd(t: &Tod) -> [u8; 6] {
    let s = t.micros() / MICROS;
    [
        SETTIME[0],
        SETTIME[1],
        (s / 3600) as u8,
        ((s / 60) % 60) as u8,
        (s % 60) as u8,
        0x74,
    ]
}

/// Decoder options held in the 27 byte configuration block
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecoderConfig {
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
    /// STA, BOX, MAN, CEL and BXX tones in Hz
    pub tones: [u16; 5],
}

impl DecoderConfig {
    pub fn parse(ibuf: &[u8]) -> Option<DecoderConfig> {
        if ibuf.len() < CONFIG_LEN {
            return None;
        }
        let flag = |i: usize| ibuf[i] != 0;
        let val = |i: usize| hexval2val(ibuf[i]) as u8;
        let mut tones = [0u16; 5];
        for (tone, &i) in tones.iter_mut().zip(CONFIG_TONES.iter()) {
            *tone = (100 * hexval2val(ibuf[i]) + hexval2val(ibuf[i + 1])) as u16;
        }
        Some(DecoderConfig {
            tod: flag(CONFIG_TOD),
            gpssync: flag(CONFIG_GPS),
            tzhour: val(CONFIG_TZ_HOUR),
            tzmin: val(CONFIG_TZ_MIN),
            dist485: flag(CONFIG_485),
            distfibre: flag(CONFIG_FIBRE),
            serprint: flag(CONFIG_PRINT),
            detectmax: flag(CONFIG_MAX),
            protocol: val(CONFIG_PROT),
            syncpulse: flag(CONFIG_PULSE),
            syncinterval: val(CONFIG_PULSEINT),
            cellsync: flag(CONFIG_CELLSYNC),
            cellhour: val(CONFIG_CELLTOD_HOUR),
            cellmin: val(CONFIG_CELLTOD_MIN),
            activeloop: flag(CONFIG_ACTIVE_LOOP),
            tones,
        })
    }

    pub fn serialise(&self) -> [u8; CONFIG_LEN] {
        let mut obuf = [0u8; CONFIG_LEN];
        // level bytes are replaced by the following level commands
        obuf[CONFIG_SPARE] = 0x13;
        obuf[CONFIG_SPARE + 1] = 0x15;
        for (&tone, &i) in self.tones.iter().zip(CONFIG_TONES.iter()) {
            obuf[i] = val2hexval(tone as u32 / 100);
            obuf[i + 1] = val2hexval(tone as u32 % 100);
        }
        for (i, v) in [
            (CONFIG_TZ_HOUR, self.tzhour),
            (CONFIG_TZ_MIN, self.tzmin),
            (CONFIG_PROT, self.protocol),
            (CONFIG_PULSEINT, self.syncinterval),
            (CONFIG_CELLTOD_HOUR, self.cellhour),
            (CONFIG_CELLTOD_MIN, self.cellmin),
        ] {
            obuf[i] = val2hexval(v as u32 % 100);
        }
        for (i, f) in [
            (CONFIG_TOD, self.tod),
            (CONFIG_GPS, self.gpssync),
            (CONFIG_485, self.dist485),
            (CONFIG_FIBRE, self.distfibre),
            (CONFIG_PRINT, self.serprint),
            (CONFIG_MAX, self.detectmax),
            (CONFIG_PULSE, self.syncpulse),
            (CONFIG_CELLSYNC, self.cellsync),
            (CONFIG_ACTIVE_LOOP, self.activeloop),
        ] {
            obuf[i] = f as u8;
        }
        return obuf;
    }
}

impl From<&ThbcConf> for DecoderConfig {
    fn from(c: &ThbcConf) -> Self {
        DecoderConfig {
            tod: c.tod,
            gpssync: c.gpssync,
            tzhour: c.tzhour,
            tzmin: c.tzmin,
            dist485: c.dist485,
            distfibre: c.distfibre,
            serprint: c.serprint,
            detectmax: c.detectmax,
            protocol: c.protocol,
            syncpulse: c.syncpulse,
            syncinterval: c.syncinterval,
            cellsync: c.cellsync,
            cellhour: c.cellhour,
            cellmin: c.cellmin,
            activeloop: c.activeloop,
            tones: [c.sta, c.boxtone, c.man, c.cel, c.bxx],
        }
    }
}

/// Contents of a `+++` configuration dump
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderInfo {
    pub config: DecoderConfig,
    pub boxname: String,
    pub version: u32,
    pub stalvl: u32,
    pub boxlvl: u32,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub host: Ipv4Addr,
}

impl DecoderInfo {
    /// Decode a dump, with the `+++` prefix removed
    pub fn parse(msg: &[u8]) -> Option<DecoderInfo> {
        if msg.len() < 48 {
            return None;
        }
        let addr = |i: usize| Ipv4Addr::new(msg[i], msg[i + 1], msg[i + 2], msg[i + 3]);
        Some(DecoderInfo {
            config: DecoderConfig::parse(msg)?,
            boxname: msg[43..47].iter().map(|&c| (c.wrapping_add(b'0')) as char).collect(),
            version: hexval2val(msg[47]),
            stalvl: hexval2val(msg[25]),
            boxlvl: hexval2val(msg[26]),
            ip: addr(27),
            netmask: addr(31),
            gateway: addr(35),
            host: addr(39),
        })
    }
}

/// Checksum state of a passing message
#[derive(Debug, PartialEq, Eq)]
pub enum Check {
    Valid,
    /// Computed sum and the sum received
    Invalid([u8; 4], Vec<u8>),
    /// Not a complete passing
    Malformed,
}

/// Check the decimal sum of a `<...>` passing message
pub fn check_passing(msg: &[u8]) -> Check {
    if msg.first() != Some(&b'<') || msg.iter().position(|&b| b == b'>') != Some(37) {
        return Check::Malformed;
    }
    let tsum = thbc_sum(&msg[1..33]);
    if tsum[..] == msg[33..37] {
        Check::Valid
    } else {
        Check::Invalid(tsum, msg[33..37].to_vec())
    }
}

/// Build a time from a checked passing payload
fn passing_tod(data: &[u8], source: &str) -> Option<Tod> {
    let text = port::decode(data);
    let pvec: Vec<&str> = text.split_whitespace().collect();
    if pvec.len() < 6 {
        return None;
    }
    let index = format!("{}:{}", pvec[3], pvec[5]);
    let refid = pvec[1].trim_start_matches('0');
    let chan = match pvec[0] {
        "BOX" => "C1",
        "MAN" => "C2",
        _ => "C0",
    };
    match pvec[5] {
        "2" => warn!("low battery on {:?}", refid),
        "3" => warn!("faulty battery on {:?}", refid),
        _ => {}
    }
    mktod(pvec[2]).map(|t| t.tagged(&index, chan, refid, source))
}

pub struct Thbc {
    cfg: ThbcConf,
    wire: Option<Wire>,
    rdbuf: Vec<u8>,
    curport: Option<String>,
    boxname: Option<String>,
    config: DecoderConfig,
    cksumerr: u32,
}

impl Thbc {
    pub fn new(cfg: ThbcConf) -> Thbc {
        Thbc {
            cfg,
            wire: None,
            rdbuf: Vec::new(),
            curport: None,
            boxname: None,
            config: DecoderConfig::default(),
            cksumerr: 0,
        }
    }

    /// Decoder id from the last configuration dump
    pub fn boxname(&self) -> Option<&str> {
        self.boxname.as_deref()
    }

    fn open(&mut self, ctx: &Context, port: Box<dyn Port>) -> Result<()> {
        self.rdbuf.clear();
        self.boxname = None;
        self.wire = Some(Wire::new(port));
        self.send(QUECMD)?;
        thread::sleep(Duration::from_millis(200));
        ctx.enqueue(Command::Sane);
        Ok(())
    }

    fn send(&mut self, msg: &[u8]) -> Result<()> {
        if let Some(w) = self.wire.as_mut() {
            w.send(msg)?;
        }
        Ok(())
    }

    fn setlvl(&mut self, lvl: u8) -> Result<()> {
        let lstr = format!("{:02}", lvl.min(99));
        info!("setting detection levels to: {}", lstr);
        self.send(&[BOXLVL, lstr.as_bytes()].concat())?;
        self.send(&[STALVL, lstr.as_bytes()].concat())
    }

    fn set_config(&mut self, config: &DecoderConfig) -> Result<()> {
        let mut cmd = vec![0x08, 0x08];
        cmd.extend_from_slice(&config.serialise());
        self.send(&v3_frame(&cmd))?;
        self.send(QUECMD)
    }

    fn passing(&mut self, ctx: &Context, msg: &[u8]) -> Result<()> {
        match check_passing(msg) {
            Check::Valid => {
                let source = self.boxname.clone().unwrap_or_default();
                match passing_tod(&msg[1..33], &source) {
                    Some(t) => {
                        debug!(target: "passing", "{}", port::decode(msg).trim());
                        self.send(ACKCMD)?;
                        self.cksumerr = 0;
                        ctx.emit(t);
                    }
                    None => error!("invalid passing: {:?}", port::decode(msg)),
                }
            }
            Check::Invalid(tsum, msum) => {
                warn!(
                    "invalid checksum: {} != {}: {:?}",
                    port::decode(&tsum),
                    port::decode(&msum),
                    port::decode(msg)
                );
                self.cksumerr += 1;
                if self.cksumerr > MAXCKSUMERR {
                    // repeated failures are taken to be a fault on the
                    // host side, the unit stalls until it is acknowledged
                    error!("erroneous message from decoder");
                    self.send(ACKCMD)?;
                }
            }
            Check::Malformed => debug!("invalid message: {:?}", port::decode(msg)),
        }
        Ok(())
    }

    fn message(&mut self, ctx: &Context, msg: &[u8]) -> Result<()> {
        if msg.len() <= 4 {
            debug!("short message: {:?}", msg);
            return Ok(());
        }
        if msg[0] == b'<' {
            self.passing(ctx, msg)?;
        } else if msg[0] == b'[' {
            let data = port::decode(&msg[1..msg.len().min(22)]);
            let pvec: Vec<&str> = data.split_whitespace().collect();
            if pvec.len() == 5 {
                info!(
                    "{}@{} noise:{}/{} levels:{}/{}",
                    self.boxname.as_deref().unwrap_or("?"),
                    pvec[0],
                    pvec[1],
                    pvec[2],
                    pvec[3],
                    pvec[4]
                );
            } else {
                info!("invalid status: {:?}", port::decode(msg));
            }
        } else if msg.starts_with(b"+++") && msg.len() > 53 {
            match DecoderInfo::parse(&msg[3..]) {
                Some(info) => {
                    info!("info decoder id: {}", info.boxname);
                    debug!("info firmware version: {}", info.version);
                    debug!("levels: sta={}, box={}", info.stalvl, info.boxlvl);
                    debug!(
                        "ip: {} mask: {} gateway: {} host: {}",
                        info.ip, info.netmask, info.gateway, info.host
                    );
                    self.boxname = Some(info.boxname);
                    self.config = info.config;
                }
                None => debug!("short config: {:?}", msg),
            }
        }
        Ok(())
    }
}

impl Decoder for Thbc {
    fn name(&self) -> &str {
        "thbc"
    }

    fn connected(&self) -> bool {
        self.wire.is_some() && self.boxname.is_some()
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
        let port: Box<dyn Port> = if !addr.contains('/') && addr.contains('.') {
            debug!("attempting udp on {}", addr);
            Box::new(Dgram::open(&addr, self.cfg.udp_port, self.cfg.read_timeout)?)
        } else {
            port::serial(&addr, self.cfg.baudrate, false, self.cfg.read_timeout)?
        };
        self.curport = Some(addr);
        self.open(ctx, port)
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
        loop {
            let ch = match self.wire.as_mut() {
                Some(w) => match w.read_byte()? {
                    Some(c) => c,
                    None => return Ok(()),
                },
                None => return Ok(()),
            };
            if ch == LF && self.rdbuf.last() == Some(&CR) {
                self.rdbuf.push(ch);
                let raw = std::mem::take(&mut self.rdbuf);
                let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
                self.message(ctx, &raw[start..])?;
            } else if self.rdbuf.len() > 40 && self.rdbuf.windows(IPDONE.len()).any(|w| w == IPDONE) {
                self.rdbuf.clear();
                info!("ip config complete");
                thread::sleep(IPWAIT);
                self.send(QUECMD)?;
            } else {
                self.rdbuf.push(ch);
            }
        }
    }

    fn sane(&mut self, _ctx: &Context) -> Result<()> {
        if self.boxname.is_some() {
            let want = DecoderConfig::from(&self.cfg);
            if want != self.config {
                debug!("config differs: {:?} != {:?}", self.config, want);
                info!("updating {} config", self.boxname.as_deref().unwrap_or("?"));
                self.set_config(&want)?;
                self.config = want;
            }
        } else {
            info!("decoder not connected");
        }
        if let Some(lvl) = self.cfg.levels {
            self.setlvl(lvl)?;
        }
        Ok(())
    }

    fn sync(&mut self, _ctx: &Context) -> Result<()> {
        let today = Local::now().date_naive();
        debug!("set date: {}", today);
        self.send(&set_date_cmd(&today))?;
        debug!("performing blocking sync");
        let nt = clock::top_of_second();
        self.send(&set_time_cmd(&nt))?;
        debug!("set time: {}", nt.meridiem(true));
        Ok(())
    }

    fn start_session(&mut self, _ctx: &Context) -> Result<()> {
        self.send(STARTCMD)
    }

    fn stop_session(&mut self, _ctx: &Context) -> Result<()> {
        self.send(STOPCMD)
    }

    fn status(&mut self, _ctx: &Context) -> Result<()> {
        self.send(STATCMD)
    }

    fn clear(&mut self, ctx: &Context) -> Result<()> {
        self.stop_session(ctx)?;
        self.start_session(ctx)?;
        self.sync(ctx)
    }

    fn write(&mut self, _ctx: &Context, msg: &[u8]) -> Result<()> {
        self.send(msg)
    }
}

/// Decoder specific requests, sent as raw commands
pub trait ThbcCommands {
    /// Request a configuration dump
    fn get_config(&self);
    /// Write the IP configuration from `cfg`
    fn ipconfig(&self, cfg: &ThbcConf);
}

impl ThbcCommands for DecoderHandle {
    fn get_config(&self) {
        self.write(QUECMD);
    }

    fn ipconfig(&self, cfg: &ThbcConf) {
        info!("starting ip config update");
        self.write(ipconfig_frame(cfg));
    }
}
