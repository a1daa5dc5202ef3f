//! Threaded interfaces to race timing decoders
//!
//! Each device runs on its own thread, fed by a FIFO command queue through
//! a [`DecoderHandle`]. Accepted passings and impulses are handed to one
//! registered callback as [`Tod`] values. Hardware and protocol errors stay
//! on the device thread: callers only see the handle's status flags.

pub mod cfg;
pub mod clock;
pub mod error;
pub mod handle;
pub mod port;
pub mod queue;
pub mod rrs;
pub mod rru;
pub mod testing;
pub mod thbc;
pub mod timy;

pub use error::{Error, Result};
pub use handle::DecoderHandle;

use parking_lot::Mutex;
use port::Port;
use queue::Queue;
use std::fmt;
use std::sync::Arc;
use todtools::{TimeValue, Tod};
use tracing::debug;

/// Impulses closer together than this need a photo finish to separate
pub const PHOTOTHRESH: Tod = Tod::from_millis(30);

/// Receives every accepted timing event, on the device thread
pub type Callback = Box<dyn FnMut(Tod) + Send>;

/// Commands executed in order by a device thread
pub enum Command {
    /// Reconnect to an address, or to the previous one if `None`
    Port(Option<String>),
    /// Use an already open transport
    Attach(Box<dyn Port>),
    Sane,
    Sync,
    StartSession,
    StopSession,
    Status,
    Clear,
    /// Deliver a synthetic impulse
    Trig(Tod),
    Replay(String),
    /// Raw device command, framed by the backend
    Write(Vec<u8>),
    Exit(Option<String>),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Port(a) => write!(f, "Port({:?})", a),
            Command::Attach(_) => write!(f, "Attach"),
            Command::Sane => write!(f, "Sane"),
            Command::Sync => write!(f, "Sync"),
            Command::StartSession => write!(f, "StartSession"),
            Command::StopSession => write!(f, "StopSession"),
            Command::Status => write!(f, "Status"),
            Command::Clear => write!(f, "Clear"),
            Command::Trig(t) => write!(f, "Trig({})", t.rawtime(4)),
            Command::Replay(r) => write!(f, "Replay({:?})", r),
            Command::Write(m) => write!(f, "Write({:?})", String::from_utf8_lossy(m)),
            Command::Exit(m) => write!(f, "Exit({:?})", m),
        }
    }
}

/// What a device thread can reach besides its own state
pub struct Context {
    name: String,
    queue: Queue,
    callback: Arc<Mutex<Option<Callback>>>,
}

impl Context {
    /// A detached context with its own queue and the default callback
    pub fn new(name: &str) -> Context {
        Context::with(name, Queue::new(), Arc::new(Mutex::new(None)))
    }

    pub(crate) fn with(name: &str, queue: Queue, callback: Arc<Mutex<Option<Callback>>>) -> Context {
        Context {
            name: name.to_string(),
            queue,
            callback,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Queue a command behind those already waiting
    pub fn enqueue(&self, cmd: Command) {
        self.queue.push(cmd);
    }

    /// Hand an accepted event to the callback
    pub fn emit(&self, t: Tod) {
        let mut cb = self.callback.lock();
        match cb.as_mut() {
            Some(f) => f(t),
            None => debug!(target: "passing", "{}", t),
        }
    }

    /// Replace the callback, `None` restores the default debug log
    pub fn set_callback(&self, cb: Option<Callback>) {
        *self.callback.lock() = cb;
    }
}

/// One kind of timing device, driven by the shared command loop
///
/// Commands a device does not support return [`Error::Unimplemented`].
pub trait Decoder: Send + 'static {
    /// Short name used for the thread, logs and event sources
    fn name(&self) -> &str;

    /// Gap between passings below which the order is not trusted
    fn photothresh(&self) -> Tod {
        PHOTOTHRESH
    }

    /// True once the device has identified itself
    fn connected(&self) -> bool;

    /// True while a transport is open
    fn is_open(&self) -> bool;

    /// Close any open port and connect to `addr`, or the last address
    fn connect(&mut self, ctx: &Context, addr: Option<&str>) -> Result<()>;

    /// Close any open port and adopt `port`
    fn attach(&mut self, ctx: &Context, port: Box<dyn Port>) -> Result<()>;

    fn close(&mut self);

    /// Service the wire until it goes quiet
    fn read(&mut self, ctx: &Context) -> Result<()>;

    /// Return the device to a known configuration
    fn sane(&mut self, _ctx: &Context) -> Result<()> {
        Err(Error::Unimplemented("sane"))
    }

    /// Align the device clock with the host
    fn sync(&mut self, _ctx: &Context) -> Result<()> {
        Err(Error::Unimplemented("sync"))
    }

    fn start_session(&mut self, _ctx: &Context) -> Result<()> {
        Err(Error::Unimplemented("start_session"))
    }

    fn stop_session(&mut self, _ctx: &Context) -> Result<()> {
        Err(Error::Unimplemented("stop_session"))
    }

    fn status(&mut self, _ctx: &Context) -> Result<()> {
        Err(Error::Unimplemented("status"))
    }

    /// Clear stored passings on the device
    fn clear(&mut self, _ctx: &Context) -> Result<()> {
        Err(Error::Unimplemented("clear"))
    }

    /// Ask the device to resend stored passings
    fn replay(&mut self, _ctx: &Context, _file: &str) -> Result<()> {
        Err(Error::Unimplemented("replay"))
    }

    fn write(&mut self, _ctx: &Context, _msg: &[u8]) -> Result<()> {
        Err(Error::Unimplemented("write"))
    }

    /// Deliver a synthetic impulse as if the device had sent it
    fn trig(&mut self, ctx: &Context, impulse: Tod) -> Result<()> {
        ctx.emit(impulse);
        Ok(())
    }
}
