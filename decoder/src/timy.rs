//! Alge Timy chronoprinter over a serial line
//!
//! Impulses arrive as CR terminated, 26 character records
//! `index channel time status`, optionally followed by a two character
//! checksum. Every impulse is logged, but only impulses on an armed
//! channel reach the callback. Arming is one-shot unless the arm lock is
//! set, see [`Arming`].

use crate::cfg::TimyConf;
use crate::handle::DecoderHandle;
use crate::port::{self, Port, Wire};
use crate::{Context, Decoder, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use todtools::chan::{chan2id, id2chan, mask_to_chans, BitOps};
use todtools::{mktod, TimeValue, Tod};
use tracing::{debug, error, info};

const CR: u8 = 0x0d;
const IMPULSE_LEN: usize = 26;
/// Messages handled before the loop checks its command queue
const READ_BURST: usize = 5;
/// Device index that triggers a memory clear
const CLEAR_INDEX: u64 = 2000;
const PRINT_WIDTH: usize = 32;

const SANE: [&str; 15] = [
    "TIMYINIT", "NSF?", "PROG?", "KL0", "CHK1", "PRE4", "RR0", "BE1", "DTS02.00", "DTF02.00",
    "EMU0", "PRINTER0", "PRIIGN1", "SL0", "PRILF",
];

/// Checksum of a Timy record: byte sum modulo 256
pub fn timy_checksum(msg: &[u8]) -> u8 {
    msg.iter().fold(0u8, |s, &b| s.wrapping_add(b))
}

/// Decode the two character checksum suffix, one nibble per character
pub fn timy_getsum(chk: &[u8]) -> Option<u8> {
    match chk {
        [ms, ls] => Some(((ms.wrapping_sub(0x30) & 0xf) << 4) | (ls.wrapping_sub(0x30) & 0xf)),
        _ => None,
    }
}

#[derive(Default)]
struct Arms {
    mask: u16,
    locked: bool,
}

/// Channel arming shared between callers and the device thread
#[derive(Clone, Default)]
pub struct Arming {
    arms: Arc<RwLock<Arms>>,
}

impl Arming {
    /// Deliver the next impulse on `chan`, false if `chan` is not a channel
    pub fn arm(&self, chan: &str) -> bool {
        match chan2id(chan) {
            Some(c) => {
                debug!("arming channel {}", id2chan(c));
                self.arms.write().mask.set(c as usize);
                true
            }
            None => false,
        }
    }

    pub fn dearm(&self, chan: &str) -> bool {
        match chan2id(chan) {
            Some(c) => {
                debug!("de-arm channel {}", id2chan(c));
                self.arms.write().mask.clear(c as usize);
                true
            }
            None => false,
        }
    }

    /// Keep channels armed after an impulse
    pub fn armlock(&self, lock: bool) {
        self.arms.write().locked = lock;
        debug!("armlock is now {}", lock);
    }

    pub fn armed(&self, chan: &str) -> bool {
        chan2id(chan).map_or(false, |c| self.arms.read().mask.check(c as usize))
    }

    pub fn locked(&self) -> bool {
        self.arms.read().locked
    }

    /// Names of the armed channels
    pub fn channels(&self) -> Vec<String> {
        mask_to_chans(self.arms.read().mask)
            .into_iter()
            .map(id2chan)
            .collect()
    }

    /// True if channel `c` is armed, disarming it unless locked
    fn take(&self, c: u8) -> bool {
        let mut arms = self.arms.write();
        if !arms.mask.check(c as usize) {
            return false;
        }
        if !arms.locked {
            arms.mask.clear(c as usize);
        }
        true
    }
}

pub struct Timy {
    cfg: TimyConf,
    wire: Option<Wire>,
    rdbuf: Vec<u8>,
    arming: Arming,
    chandelay: BTreeMap<u8, Tod>,
    clearing: bool,
}

impl Timy {
    pub fn new(cfg: TimyConf) -> Timy {
        let chandelay = cfg.delays();
        debug!("serial {} baud, ctsrts {}", cfg.baudrate, cfg.ctsrts);
        Timy {
            cfg,
            wire: None,
            rdbuf: Vec::new(),
            arming: Arming::default(),
            chandelay,
            clearing: false,
        }
    }

    /// Arming handle, keep a clone before the device is started
    pub fn arming(&self) -> Arming {
        self.arming.clone()
    }

    fn send(&mut self, msg: &str) -> Result<()> {
        if let Some(w) = self.wire.as_mut() {
            debug!("send: {:?}", msg);
            let mut out = port::encode(msg.trim_end());
            out.push(CR);
            w.send(&out)?;
        }
        Ok(())
    }

    /// Parse one record, returning an impulse if it is one
    fn parse(&mut self, raw: &[u8]) -> Option<Tod> {
        let mut end = raw.len();
        while end > 0 && raw[end - 1].is_ascii_whitespace() {
            end -= 1;
        }
        let mut msg = &raw[..end];
        let mut sums = (Some(0), 0);
        if msg.len() == IMPULSE_LEN + 2 {
            sums = (timy_getsum(&msg[IMPULSE_LEN..]), 0);
            msg = &msg[..IMPULSE_LEN];
            sums.1 = timy_checksum(msg);
        }
        let text = port::decode(msg);
        if msg.len() != IMPULSE_LEN {
            self.reply(text.trim());
            return None;
        }
        if sums.0 != Some(sums.1) {
            error!("corrupt message: {:?}", text);
            error!("checksum fail: {:02X?} != 0x{:02X}", sums.0, sums.1);
            return None;
        }
        let e: Vec<&str> = text.split_whitespace().collect();
        if e.len() != 4 {
            error!("invalid message: {:?}", text);
            return None;
        }
        let mut t = match mktod(e[2]) {
            Some(t) => t,
            None => {
                error!("invalid message: {:?}", text);
                return None;
            }
        };
        if let Some(delay) = chan2id(e[1]).and_then(|c| self.chandelay.get(&c)) {
            // may wrap back over midnight
            t = &t - delay;
        }
        Some(t.tagged(e[0], e[1], "", self.name()))
    }

    fn reply(&mut self, msg: &str) {
        if msg == "CLR" {
            debug!("memory cleared");
            self.clearing = false;
        } else if msg.starts_with("HW_SN") {
            info!("{:?} connected", msg.split_whitespace().last().unwrap_or(""));
        } else if let Some(v) = msg.strip_prefix("NSF") {
            info!("version: {:?}", v);
        } else if msg.starts_with("PROG:") {
            debug!("program: {:?}", msg.split_whitespace().last().unwrap_or(""));
        }
    }

    fn impulse(&mut self, ctx: &Context, st: Tod) -> Result<()> {
        info!(target: "passing", "{}", st);
        if let Some(c) = chan2id(&st.chan) {
            let index = st.index.parse::<u64>().ok();
            if self.arming.take(c) {
                ctx.emit(st);
            }
            if let Some(i) = index {
                if i > CLEAR_INDEX && !self.clearing {
                    self.clearing = true;
                    debug!("auto clear memory");
                    self.send("CLR")?;
                }
            }
        }
        Ok(())
    }
}

impl Decoder for Timy {
    fn name(&self) -> &str {
        "timy"
    }

    fn connected(&self) -> bool {
        self.wire.is_some()
    }

    fn is_open(&self) -> bool {
        self.wire.is_some()
    }

    /// Open `addr`, or run without a device when it is missing or `NULL`
    fn connect(&mut self, ctx: &Context, addr: Option<&str>) -> Result<()> {
        self.close();
        match addr {
            Some(a) if !a.is_empty() && a != "NULL" && a != "None" => {
                debug!("re-connect port: {} @ {}", a, self.cfg.baudrate);
                let p = port::serial(a, self.cfg.baudrate, self.cfg.ctsrts, self.cfg.read_timeout)?;
                self.attach(ctx, p)
            }
            _ => {
                debug!("not connected");
                Ok(())
            }
        }
    }

    fn attach(&mut self, _ctx: &Context, port: Box<dyn Port>) -> Result<()> {
        self.close();
        self.rdbuf.clear();
        self.wire = Some(Wire::new(port));
        Ok(())
    }

    fn close(&mut self) {
        if let Some(w) = self.wire.take() {
            w.close();
        }
    }

    fn read(&mut self, ctx: &Context) -> Result<()> {
        let mut mcnt = 0;
        loop {
            let ch = match self.wire.as_mut() {
                Some(w) => match w.read_byte()? {
                    Some(c) => c,
                    None => return Ok(()),
                },
                None => return Ok(()),
            };
            self.rdbuf.push(ch);
            if ch == CR {
                let raw = std::mem::take(&mut self.rdbuf);
                debug!("recv: {:?}", port::decode(&raw));
                if let Some(t) = self.parse(&raw) {
                    self.impulse(ctx, t)?;
                }
                mcnt += 1;
                if mcnt >= READ_BURST {
                    return Ok(());
                }
            }
        }
    }

    fn sane(&mut self, _ctx: &Context) -> Result<()> {
        for msg in SANE {
            self.send(msg)?;
        }
        Ok(())
    }

    fn status(&mut self, _ctx: &Context) -> Result<()> {
        self.send("NSF?")?;
        self.send("PROG?")
    }

    /// Clear the device memory
    fn clear(&mut self, _ctx: &Context) -> Result<()> {
        self.send("CLR")
    }

    /// Dump every stored impulse, the reference is ignored
    fn replay(&mut self, _ctx: &Context, _file: &str) -> Result<()> {
        self.send("RSM")
    }

    fn write(&mut self, _ctx: &Context, msg: &[u8]) -> Result<()> {
        self.send(&port::decode(msg))
    }

    /// Treat `impulse` as if it had been read from the device
    fn trig(&mut self, ctx: &Context, impulse: Tod) -> Result<()> {
        self.impulse(ctx, impulse)
    }
}

/// Chronoprinter commands, queued as raw writes
pub trait TimyCommands {
    /// Print a line of at most 32 characters
    fn printline(&self, msg: &str);
    fn linefeed(&self);
    fn clrmem(&self);
    /// Request every recorded impulse
    fn dumpall(&self);
    /// Set the start and finish blocking delay, between 0 and 99.99 s
    fn delaytime(&self, delay: &str);
    fn printer(&self, enable: bool);
    /// Print every impulse on the receipt printer
    fn printimp(&self, doprint: bool);
    fn keylock(&self, lock: bool);
}

impl TimyCommands for DecoderHandle {
    fn printline(&self, msg: &str) {
        let line: String = msg.chars().take(PRINT_WIDTH).collect();
        info!(target: "passing", "{}", line);
        self.write(format!("DTP{}", line));
    }

    fn linefeed(&self) {
        self.write("PRILF");
    }

    fn clrmem(&self) {
        self.write("CLR");
    }

    fn dumpall(&self) {
        self.write("RSM");
    }

    fn delaytime(&self, delay: &str) {
        let max = Tod::from_micros(99_990_000).unwrap_or(Tod::MAX);
        match mktod(delay) {
            Some(dt) if dt > Tod::ZERO && dt < max => {
                let full = dt.rawtime_with(2, true, "h", ":");
                let nt = full.get(6..).unwrap_or("");
                self.write(format!("DTS{}", nt));
                self.write(format!("DTF{}", nt));
            }
            Some(dt) => info!("ignoring invalid delay time: {}", dt.rawtime(2)),
            None => info!("ignoring invalid delay time"),
        }
    }

    fn printer(&self, enable: bool) {
        self.write(if enable { "PRINTER1" } else { "PRINTER0" });
    }

    fn printimp(&self, doprint: bool) {
        self.write(if doprint { "PRIIGN0" } else { "PRIIGN1" });
    }

    fn keylock(&self, lock: bool) {
        self.write(if lock { "KL1" } else { "KL0" });
    }
}
