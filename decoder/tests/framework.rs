use decoder::port::Port;
use decoder::testing::ScriptedPort;
use decoder::rrs::Rrs;
use decoder::{Context, Decoder, DecoderHandle, Error, Result, PHOTOTHRESH};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use todtools::{TimeValue, Tod};

#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

/// Records every command it runs, sane takes `slow` to finish
struct Recorder {
    log: Log,
    port: Option<Box<dyn Port>>,
    slow: Duration,
}

impl Recorder {
    fn new(log: &Log) -> Recorder {
        Recorder {
            log: log.clone(),
            port: None,
            slow: Duration::ZERO,
        }
    }

    fn slow(log: &Log) -> Recorder {
        Recorder {
            slow: Duration::from_millis(200),
            ..Recorder::new(log)
        }
    }
}

impl Decoder for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn connected(&self) -> bool {
        self.port.is_some()
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn connect(&mut self, _ctx: &Context, addr: Option<&str>) -> Result<()> {
        self.close();
        self.log.push(format!("connect {}", addr.unwrap_or("-")));
        Ok(())
    }

    fn attach(&mut self, _ctx: &Context, port: Box<dyn Port>) -> Result<()> {
        self.close();
        self.log.push("attach");
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut p) = self.port.take() {
            let _ = p.shutdown();
        }
    }

    fn read(&mut self, _ctx: &Context) -> Result<()> {
        if let Some(p) = self.port.as_mut() {
            let mut buf = [0u8; 64];
            match p.read(&mut buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(n) => self.log.push(format!("read {}", n)),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn sane(&mut self, _ctx: &Context) -> Result<()> {
        self.log.push("sane");
        thread::sleep(self.slow);
        Ok(())
    }

    fn status(&mut self, _ctx: &Context) -> Result<()> {
        self.log.push("status");
        Ok(())
    }

    fn replay(&mut self, _ctx: &Context, file: &str) -> Result<()> {
        Err(Error::Replay(file.to_string()))
    }

    fn write(&mut self, _ctx: &Context, msg: &[u8]) -> Result<()> {
        if let Some(p) = self.port.as_mut() {
            p.write_all(msg)?;
        }
        self.log.push(format!("write {}", String::from_utf8_lossy(msg)));
        Ok(())
    }
}

#[test]
fn commands_run_in_queue_order() {
    let log = Log::default();
    let h = DecoderHandle::start(Recorder::new(&log)).unwrap();
    h.sane();
    h.status();
    h.write("PING");
    h.status();
    h.wait();
    assert_eq!(vec!["sane", "status", "write PING", "status"], log.entries());
    assert!(h.running());
    assert!(!h.connected());
}

#[test]
fn unsupported_commands_do_not_stop_the_thread() {
    let log = Log::default();
    let h = DecoderHandle::start(Recorder::new(&log)).unwrap();
    h.sync();
    h.clear();
    h.replay("nope");
    h.status();
    h.wait();
    assert_eq!(vec!["status"], log.entries());
    assert!(h.running());
    assert!(!h.error());
}

#[test]
fn setport_drops_queued_commands() {
    let log = Log::default();
    let h = DecoderHandle::start(Recorder::slow(&log)).unwrap();
    h.sane();
    // let the thread pick up the slow command
    thread::sleep(Duration::from_millis(50));
    h.status();
    h.status();
    h.setport(Some("/dev/ttyUSB0"));
    h.wait();
    assert_eq!(vec!["sane", "connect /dev/ttyUSB0"], log.entries());
}

#[test]
fn exit_stops_the_thread_and_drops_the_queue() {
    let log = Log::default();
    let h = DecoderHandle::start(Recorder::slow(&log)).unwrap();
    h.sane();
    thread::sleep(Duration::from_millis(50));
    h.exit(Some("finished"));
    h.status();
    h.wait();
    assert!(!h.running());
    assert_eq!(vec!["sane"], log.entries());
    h.join();
}

#[test]
fn photo_finish_threshold() {
    assert_eq!("0.030", PHOTOTHRESH.rawtime(3));
    let h = DecoderHandle::start(Rrs::new(Default::default())).unwrap();
    assert_eq!(&PHOTOTHRESH, h.photothresh());
    let a: Tod = "12:00:00.010".parse().unwrap();
    let b: Tod = "12:00:00.035".parse().unwrap();
    assert!(&b - &a < PHOTOTHRESH);
    h.exit(None);
    h.join();
}

#[test]
fn trig_reaches_the_callback() {
    let log = Log::default();
    let h = DecoderHandle::start(Recorder::new(&log)).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    h.setcb(move |t: Tod| s.lock().push(t));

    let t: Tod = "12:00:01.5".parse().unwrap();
    h.trig(t.tagged("1", "C1", "", "test"));
    h.wait();
    h.clearcb();
    h.trig("12:00:02".parse().unwrap());
    h.wait();

    let seen = seen.lock();
    assert_eq!(1, seen.len());
    assert_eq!("C1", seen[0].chan);
    assert_eq!("test", seen[0].source);
}

#[test]
fn io_failure_closes_the_port_and_flags_an_error() {
    let log = Log::default();
    let h = DecoderHandle::start(Recorder::new(&log)).unwrap();
    let wire = ScriptedPort::new();
    h.attach(wire.boxed());
    h.wait();
    assert!(h.connected());
    assert!(!h.error());

    wire.feed(b"abc");
    h.write("one");
    h.wait();
    assert_eq!("one", wire.written_str());

    // writes to a shut down port fail with a broken pipe
    wire.clone().shutdown().unwrap();
    h.write("two");
    h.status();
    h.wait();
    assert!(h.error());
    assert!(!h.connected());
    assert!(h.running());
    let entries = log.entries();
    assert!(entries.contains(&String::from("read 3")));
    assert!(!entries.contains(&String::from("write two")));
    assert_eq!(Some(&String::from("status")), entries.last());

    h.attach(ScriptedPort::new().boxed());
    h.wait();
    assert!(!h.error());
    assert!(h.connected());
}
