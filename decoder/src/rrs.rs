//! Race Result System decoder over TCP
//!
//! The decoder speaks a CRLF terminated line protocol of `;` separated
//! fields. Passings are pushed as `#P;...` and missed ones are fetched back
//! with `{first}:{count}` requests. Delivered passings always carry
//! contiguous, increasing passing numbers: anything out of sequence is
//! dropped and fetched again.

use crate::cfg::RrsConf;
use crate::port::{self, Port, Wire};
use crate::{Command, Context, Decoder, Error, Result};
use chrono::Local;
use todtools::mktod;
use tracing::{debug, error, info, warn};

/// Protocol level requested with `SETPROTOCOL`
pub const PROTOCOL: &str = "3.0";
const EOL: &str = "\r\n";
const STATUSLEN: usize = 25;
const LOWBATT: f64 = 2.3;
/// Passings requested per refetch
const FETCHLEN: u64 = 32;

const ERROR_FLAGS: [(u32, &str); 7] = [
    (1, "UHF module reports an error"),
    (16, "Active loop error"),
    (32, "Active loop limit"),
    (64, "Active connection lost"),
    (256, "GPS time sync error"),
    (512, "GPS communication error warning"),
    (1024, "Active time sync error"),
];

/// Fields of one passing record, in either record shape
struct Record<'a> {
    index: &'a str,
    tag: &'a str,
    time: &'a str,
    eventid: &'a str,
    hits: &'a str,
    rssi: &'a str,
    isactive: &'a str,
    loopid: &'a str,
    battery: &'a str,
    adata: &'a str,
    boxname: &'a str,
}

impl<'a> Record<'a> {
    fn parse(pv: &[&'a str]) -> Option<Record<'a>> {
        // both shapes share the first eleven fields
        let (battery, adata, boxname) = match pv.len() {
            16 => (pv[12], pv[13], pv[15]),
            20 => (pv[13], pv[15], pv[16]),
            _ => return None,
        };
        Some(Record {
            index: pv[0],
            tag: pv[1],
            time: pv[3],
            eventid: pv[4],
            hits: pv[5],
            rssi: pv[6],
            isactive: pv[8],
            loopid: pv[10],
            battery,
            adata,
            boxname,
        })
    }
}

/// Status bits set in a `GETSTATUS` error flag field
pub fn error_flags(eflag: u32) -> Vec<&'static str> {
    ERROR_FLAGS
        .iter()
        .filter(|(bit, _)| eflag & bit == *bit)
        .map(|(_, msg)| *msg)
        .collect()
}

/// True when hit count or signal levels suggest an unreliable read
pub(crate) fn poor_read(hits: u32, rssi: u32, minhits: u32, minloop: i32) -> Option<(i32, i32)> {
    let twofour = -90 + ((rssi & 0x70) >> 2) as i32;
    let lstrength = 1 + (rssi & 0x0f) as i32;
    if lstrength < minloop || twofour < -82 || hits < minhits {
        Some((twofour, lstrength))
    } else {
        None
    }
}

pub struct Rrs {
    cfg: RrsConf,
    wire: Option<Wire>,
    rdbuf: Vec<u8>,
    curport: Option<String>,
    curfile: Option<i64>,
    lastpassing: Option<u64>,
    dorefetch: bool,
    fetchpending: bool,
    /// Requested passings are arriving
    receiving: bool,
    boxname: Option<String>,
}

impl Rrs {
    pub fn new(cfg: RrsConf) -> Rrs {
        debug!("allow stored passings: {}", cfg.allowstored);
        debug!("passive loop id: {}", cfg.passiveloop);
        Rrs {
            cfg,
            wire: None,
            rdbuf: Vec::new(),
            curport: None,
            curfile: None,
            lastpassing: None,
            dorefetch: false,
            fetchpending: false,
            receiving: false,
            boxname: None,
        }
    }

    /// Number of the last passing delivered or skipped
    pub fn last_passing(&self) -> Option<u64> {
        self.lastpassing
    }

    fn open(&mut self, ctx: &Context, port: Box<dyn Port>) {
        self.wire = Some(Wire::new(port));
        self.rdbuf.clear();
        self.receiving = false;
        self.fetchpending = false;
        ctx.enqueue(Command::Sane);
    }

    fn send(&mut self, msg: &str) -> Result<()> {
        if let Some(w) = self.wire.as_mut() {
            w.send(&port::encode(&format!("{}{}", msg, EOL)))?;
        }
        Ok(())
    }

    fn settime(&mut self) -> Result<()> {
        let now = Local::now();
        let cmd = format!("SETTIME;{}", now.format("%Y-%m-%d;%H:%M:%S%.3f"));
        self.send(&cmd)
    }

    fn refetch(&mut self) -> Result<()> {
        if !self.fetchpending && self.dorefetch {
            if let Some(last) = self.lastpassing {
                self.fetchpending = true;
                self.dorefetch = false;
                self.send(&format!("{}:{}", last + 1, FETCHLEN))?;
            }
        }
        Ok(())
    }

    fn passing(&mut self, ctx: &Context, pv: &[&str]) {
        let rec = match Record::parse(pv) {
            Some(r) => r,
            None => {
                info!("non-passing message: {:?}", pv.join(";"));
                return;
            }
        };
        let pid: u64 = match rec.index.parse() {
            Ok(p) => p,
            Err(_) => {
                error!("invalid passing number {:?}", rec.index);
                return;
            }
        };
        if let Some(last) = self.lastpassing {
            if pid != last + 1 {
                debug!("ignore out of sequence passing: {} != {}", pid, last + 1);
                self.dorefetch = true;
                return;
            }
        }
        self.lastpassing = Some(pid);

        let mut eventid = rec.eventid;
        let active = match rec.isactive.parse::<i64>() {
            Ok(v) => {
                if eventid == "0" {
                    eventid = "";
                }
                v != 0
            }
            Err(_) => {
                debug!("unreadable active flag {:?}", rec.isactive);
                false
            }
        };

        let passive = self.cfg.passiveloop.to_string();
        let loopid = if rec.loopid.is_empty() { passive.as_str() } else { rec.loopid };
        let chan = match loopid.trim().parse::<u32>() {
            Ok(n) => format!("C{}", n),
            Err(_) => loopid.to_string(),
        };

        let activestore = active && rec.adata.parse::<u32>().map_or(false, |v| v & 0x40 == 0x40);
        let mut tag = rec.tag.to_string();
        if !active && !tag.is_empty() && !eventid.is_empty() {
            tag = format!("{}-{}", eventid, tag);
        }
        if tag == self.cfg.trigno {
            tag.clear();
        }

        if !rec.battery.is_empty() && !tag.is_empty() {
            match rec.battery.parse::<f64>() {
                Ok(bv) if bv < LOWBATT => warn!("low battery {}: {:.1}V", tag, bv),
                Ok(_) => {}
                Err(_) => debug!("unreadable battery voltage {:?}", rec.battery),
            }
        }
        if !rec.hits.is_empty() && !rec.rssi.is_empty() && !tag.is_empty() {
            match (u32::from_str_radix(rec.hits, 16), u32::from_str_radix(rec.rssi, 16)) {
                (Ok(hits), Ok(rssi)) => {
                    if let Some((twofour, lstrength)) = poor_read(hits, rssi, 3, 3) {
                        warn!(
                            "poor read {}: hits:{} rssi:{}dBm loop:{}dB",
                            tag, hits, twofour, lstrength
                        );
                    }
                }
                _ => debug!("unreadable hits/rssi {:?}/{:?}", rec.hits, rec.rssi),
            }
        }

        debug!(target: "passing", "{}", pv.join(";"));

        match mktod(rec.time) {
            Some(t) => {
                let t = t.tagged(rec.index, &chan, &tag, rec.boxname);
                if !activestore || self.cfg.allowstored {
                    ctx.emit(t);
                } else {
                    debug!("stored passing {} not reported", rec.index);
                }
            }
            None => error!("invalid passing time {:?}", rec.time),
        }
    }

    fn statusmsg(&self, pv: &[&str]) {
        if pv.len() != STATUSLEN {
            return;
        }
        let pwr = pv[2];
        let opmode = pv[4];
        let uhf = pv[8];
        let batt = if pv[9] == "-1" {
            String::from("[estimating]")
        } else {
            format!("{}%", pv[9])
        };
        let (loopch, loopid, looppower) = if pv[13] == "1" {
            (pv[14].to_string(), pv[15].to_string(), pv[16].to_string())
        } else {
            (pv[3].to_string(), self.cfg.passiveloop.to_string(), String::from("n/a"))
        };
        if opmode == "1" {
            info!(
                "started, charge:{}, uhf:{}, batt:{}, ch:{}, loop:{}, power:{}",
                pwr, uhf, batt, loopch, loopid, looppower
            );
        } else {
            warn!(
                "not started, charge:{}, uhf:{}, batt:{}, ch:{}, loop:{}, power:{}",
                pwr, uhf, batt, loopch, loopid, looppower
            );
        }
        if pv[23] != "0" {
            match pv[23].parse::<u32>() {
                Ok(flags) => error!("error: {}", error_flags(flags).join(", ")),
                Err(_) => error!("error flags: {:?}", pv[23]),
            }
        }
    }

    fn configmsg(&mut self, pv: &[&str]) {
        if pv.len() > 3 {
            match pv[1] {
                "BOXNAME" => {
                    info!("{:?} connected", pv[3]);
                    self.boxname = Some(pv[3].to_string());
                }
                "LOOPID" => info!("config loop id: {}", pv[3]),
                "POWER" => info!("config loop power: {}", pv[3]),
                "CONNECTION" => info!("config upload connection: {}", pv[3]),
                _ => debug!("config {:?}", pv.join(";")),
            }
        }
    }

    fn protocolmsg(&self, pv: &[&str]) {
        if pv.len() == 3 && PROTOCOL > pv[2] {
            error!("protocol {} unsupported (max {}), update firmware", PROTOCOL, pv[2]);
        }
    }

    fn passingsmsg(&mut self, pv: &[&str]) {
        let newfile = match pv.get(1) {
            Some(f) => match f.parse::<i64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    debug!("unreadable passing file {:?}", f);
                    return;
                }
            },
            None => None,
        };
        let newidx = match pv.first().and_then(|v| v.parse::<u64>().ok()) {
            Some(v) => v,
            None => {
                debug!("unreadable passing count {:?}", pv);
                return;
            }
        };
        if newfile != self.curfile {
            debug!("new passing file {:?}", newfile);
            self.curfile = newfile;
            self.lastpassing = Some(newidx);
        } else {
            match self.lastpassing {
                Some(last) if newidx >= last => {
                    debug!("missed {} passings, last passing = {}", newidx - last, last);
                }
                last => {
                    debug!("last passing {:?} updated to {}", last, newidx);
                    self.lastpassing = Some(newidx);
                }
            }
        }
        self.fetchpending = false;
    }

    fn procmsg(&mut self, ctx: &Context, msg: &str) {
        let mv: Vec<&str> = msg.trim().split(';').collect();
        let head = mv[0];
        if !head.is_empty() && head.bytes().all(|b| b.is_ascii_digit()) {
            self.receiving = true;
            self.passing(ctx, &mv);
        } else if head.starts_with("ONLY ") {
            self.fetchpending = false;
        } else {
            match head {
                "#P" => self.passing(ctx, &mv[1..]),
                "GETSTATUS" => self.statusmsg(&mv[1..]),
                "GETCONFIG" => self.configmsg(&mv[1..]),
                "GETPROTOCOL" => self.protocolmsg(&mv[1..]),
                "PASSINGS" => self.passingsmsg(&mv[1..]),
                "SETTIME" => info!("time set to: {}", mv[1..].join(" ")),
                "STARTOPERATION" | "STOPOPERATION" => {
                    self.curfile = None;
                    self.lastpassing = None;
                    if head == "STARTOPERATION" {
                        info!("start session");
                    } else {
                        info!("stop session");
                    }
                }
                "" => {
                    debug!("end of requested passings");
                    self.fetchpending = false;
                    self.receiving = false;
                    self.dorefetch = true;
                }
                _ => {}
            }
        }
    }
}

impl Decoder for Rrs {
    fn name(&self) -> &str {
        "rrs"
    }

    fn connected(&self) -> bool {
        self.wire.is_some()
    }

    fn is_open(&self) -> bool {
        self.wire.is_some()
    }

    fn connect(&mut self, ctx: &Context, addr: Option<&str>) -> Result<()> {
        self.close();
        let addr = match addr.map(String::from).or_else(|| self.curport.clone()) {
            Some(a) => a,
            None => {
                debug!("re-connect cancelled: no address");
                return Ok(());
            }
        };
        let stream = port::tcp(&addr, self.cfg.port, self.cfg.read_timeout)?;
        self.open(ctx, stream);
        self.curport = Some(addr);
        Ok(())
    }

    fn attach(&mut self, ctx: &Context, port: Box<dyn Port>) -> Result<()> {
        self.close();
        self.open(ctx, port);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(w) = self.wire.take() {
            debug!("close connection");
            w.close();
        }
    }

    fn read(&mut self, ctx: &Context) -> Result<()> {
        loop {
            let next = match self.wire.as_mut() {
                Some(w) => w.read_byte()?,
                None => return Ok(()),
            };
            match next {
                None => {
                    self.dorefetch = true;
                    break;
                }
                Some(b'\n') => {
                    let line = port::decode(&std::mem::take(&mut self.rdbuf));
                    self.procmsg(ctx, &line);
                    if !self.receiving {
                        break;
                    }
                }
                Some(b) => self.rdbuf.push(b),
            }
        }
        self.refetch()
    }

    fn sane(&mut self, _ctx: &Context) -> Result<()> {
        let protocol = format!("SETPROTOCOL;{}", PROTOCOL);
        for m in [
            "GETPROTOCOL",
            protocol.as_str(),
            "SETPUSHPREWARNS;0",
            "SETPUSHPASSINGS;1;0",
            "GETCONFIG;GENERAL;BOXNAME",
            "GETCONFIG;ACTIVE;LOOPID",
            "GETCONFIG;ACTIVE;POWER",
            "GETCONFIG;UPLOAD;CONNECTION",
            "GETINTERFACES",
            "GETSTATUS",
            "PASSINGS",
        ] {
            self.send(m)?;
        }
        Ok(())
    }

    fn sync(&mut self, ctx: &Context) -> Result<()> {
        self.stop_session(ctx)?;
        self.settime()?;
        self.start_session(ctx)
    }

    fn start_session(&mut self, _ctx: &Context) -> Result<()> {
        self.send("STARTOPERATION")?;
        self.send("PASSINGS")
    }

    fn stop_session(&mut self, _ctx: &Context) -> Result<()> {
        self.send("STOPOPERATION")
    }

    fn status(&mut self, _ctx: &Context) -> Result<()> {
        self.send("GETSTATUS")
    }

    fn clear(&mut self, ctx: &Context) -> Result<()> {
        self.stop_session(ctx)?;
        self.send("CLEARFILES")?;
        self.settime()?;
        self.start_session(ctx)
    }

    fn replay(&mut self, _ctx: &Context, file: &str) -> Result<()> {
        if file.is_empty() || !file.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Replay(file.to_string()));
        }
        let n: u64 = file.parse().map_err(|_| Error::Replay(file.to_string()))?;
        debug!("replay passings from file {}", n);
        self.send(&format!("GETFILE;{}", n))
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
    fn status_error_flags() {
        assert!(error_flags(0).is_empty());
        assert_eq!(error_flags(1), vec!["UHF module reports an error"]);
        assert_eq!(
            error_flags(16 | 1024),
            vec!["Active loop error", "Active time sync error"]
        );
    }

    #[test]
    fn read_quality() {
        assert_eq!(poor_read(4, 0x7f, 3, 3), None);
        // weak loop
        assert_eq!(poor_read(4, 0x71, 3, 3), Some((-62, 2)));
        // weak 2.4GHz signal
        assert_eq!(poor_read(4, 0x0f, 3, 3), Some((-90, 16)));
        assert!(poor_read(2, 0x7f, 3, 3).is_some());
    }

    #[test]
    fn record_shapes() {
        let short: Vec<&str> = "1;00123;2024-01-01;12:00:00.500;0;4;50;1;1;1;C1;0;3.0;0;64;BoxA"
            .split(';')
            .collect();
        let r = Record::parse(&short).unwrap();
        assert_eq!(r.boxname, "BoxA");
        assert_eq!(r.adata, "0");
        assert_eq!(r.battery, "3.0");

        let long: Vec<&str> =
            "2;00124;2024-01-01;12:00:01.000;0;4;50;1;1;1;2;0;7;2.9;21;64;BoxB;1;2;A-1"
                .split(';')
                .collect();
        let r = Record::parse(&long).unwrap();
        assert_eq!(r.loopid, "2");
        assert_eq!(r.battery, "2.9");
        assert_eq!(r.adata, "64");
        assert_eq!(r.boxname, "BoxB");

        assert!(Record::parse(&short[..10]).is_none());
    }
}
