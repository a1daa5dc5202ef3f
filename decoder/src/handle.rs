//! Device thread and the handle callers use to command it

use crate::port::Port;
use crate::queue::Queue;
use crate::{Callback, Command, Context, Decoder, Error};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use todtools::Tod;
use tracing::{debug, error, info, span, Level};

#[derive(Default)]
struct Status {
    running: AtomicBool,
    connected: AtomicBool,
    error: AtomicBool,
}

/// Owns a device thread. Every method only queues a command.
pub struct DecoderHandle {
    name: String,
    photothresh: Tod,
    queue: Queue,
    callback: Arc<Mutex<Option<Callback>>>,
    status: Arc<Status>,
    join_handle: Option<thread::JoinHandle<()>>,
}

impl DecoderHandle {
    /// Spawn the command loop for `device`
    pub fn start<D: Decoder>(device: D) -> crate::Result<DecoderHandle> {
        let name = device.name().to_string();
        let photothresh = device.photothresh();
        let queue = Queue::new();
        let callback = Arc::new(Mutex::new(None));
        let status = Arc::new(Status::default());
        status.running.store(true, Ordering::SeqCst);

        let ctx = Context::with(&name, queue.clone(), callback.clone());
        let thread_status = status.clone();
        let join_handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(device, ctx, thread_status))?;

        Ok(DecoderHandle {
            name,
            photothresh,
            queue,
            callback,
            status,
            join_handle: Some(join_handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Photo finish threshold of the device
    pub fn photothresh(&self) -> &Tod {
        &self.photothresh
    }

    /// Register the event callback, replacing any previous one
    pub fn setcb<F>(&self, f: F)
    where
        F: FnMut(Tod) + Send + 'static,
    {
        *self.callback.lock() = Some(Box::new(f));
    }

    /// Restore the default callback
    pub fn clearcb(&self) {
        *self.callback.lock() = None;
    }

    /// Drop queued commands, then reconnect
    pub fn setport(&self, addr: Option<&str>) {
        let n = self.queue.flush();
        if n > 0 {
            debug!("{}: flushed {} queued commands", self.name, n);
        }
        self.queue.push(Command::Port(addr.map(String::from)));
    }

    /// Drop queued commands, then adopt an open transport
    pub fn attach(&self, port: Box<dyn Port>) {
        self.queue.flush();
        self.queue.push(Command::Attach(port));
    }

    pub fn sane(&self) {
        self.queue.push(Command::Sane);
    }

    pub fn sync(&self) {
        self.queue.push(Command::Sync);
    }

    pub fn start_session(&self) {
        self.queue.push(Command::StartSession);
    }

    pub fn stop_session(&self) {
        self.queue.push(Command::StopSession);
    }

    pub fn status(&self) {
        self.queue.push(Command::Status);
    }

    pub fn clear(&self) {
        self.queue.push(Command::Clear);
    }

    pub fn trig(&self, impulse: Tod) {
        self.queue.push(Command::Trig(impulse));
    }

    pub fn replay(&self, file: &str) {
        self.queue.push(Command::Replay(file.to_string()));
    }

    pub fn write(&self, msg: impl Into<Vec<u8>>) {
        self.queue.push(Command::Write(msg.into()));
    }

    /// Stop the thread once the commands ahead of this one have run
    pub fn exit(&self, reason: Option<&str>) {
        self.queue.push(Command::Exit(reason.map(String::from)));
    }

    /// Block until every command queued so far has been executed
    pub fn wait(&self) {
        self.queue.join();
    }

    pub fn running(&self) -> bool {
        self.status.running.load(Ordering::SeqCst)
    }

    pub fn connected(&self) -> bool {
        self.status.connected.load(Ordering::SeqCst)
    }

    /// True after an i/o failure, until the next successful connect
    pub fn error(&self) -> bool {
        self.status.error.load(Ordering::SeqCst)
    }

    /// Wait for the device thread to finish
    pub fn join(mut self) {
        if let Some(h) = self.join_handle.take() {
            if h.join().is_err() {
                error!("{}: device thread panicked", self.name);
            }
        }
    }
}

impl Drop for DecoderHandle {
    fn drop(&mut self) {
        if let Some(h) = self.join_handle.take() {
            if self.running() {
                self.queue.push(Command::Exit(Some(String::from("handle dropped"))));
            }
            let _ = h.join();
        }
    }
}

fn run<D: Decoder>(mut device: D, ctx: Context, status: Arc<Status>) {
    let span = span!(Level::INFO, "decoder", name = %ctx.name());
    let _enter = span.enter();
    debug!("starting");
    while status.running.load(Ordering::SeqCst) {
        let cmd = if device.is_open() {
            if let Err(e) = device.read(&ctx) {
                fail(&mut device, &status, e);
            }
            ctx.queue().try_pop()
        } else {
            match ctx.queue().pop() {
                Some(c) => Some(c),
                None => break,
            }
        };
        if let Some(cmd) = cmd {
            let exit = matches!(cmd, Command::Exit(_));
            let reconnect = matches!(cmd, Command::Port(_) | Command::Attach(_));
            match execute(&mut device, &ctx, cmd) {
                Ok(()) if reconnect => status.error.store(!device.is_open(), Ordering::SeqCst),
                Ok(()) => {}
                Err(e) => fail(&mut device, &status, e),
            }
            status.connected.store(device.connected(), Ordering::SeqCst);
            if exit {
                status.running.store(false, Ordering::SeqCst);
            }
            ctx.queue().done();
        }
        status.connected.store(device.connected(), Ordering::SeqCst);
    }
    device.close();
    ctx.set_callback(None);
    status.connected.store(false, Ordering::SeqCst);
    status.running.store(false, Ordering::SeqCst);
    debug!("exiting");
}

fn execute<D: Decoder>(device: &mut D, ctx: &Context, cmd: Command) -> crate::Result<()> {
    match cmd {
        Command::Port(addr) => device.connect(ctx, addr.as_deref()),
        Command::Attach(port) => device.attach(ctx, port),
        Command::Sane => device.sane(ctx),
        Command::Sync => device.sync(ctx),
        Command::StartSession => device.start_session(ctx),
        Command::StopSession => device.stop_session(ctx),
        Command::Status => device.status(ctx),
        Command::Clear => device.clear(ctx),
        Command::Trig(t) => device.trig(ctx, t),
        Command::Replay(file) => device.replay(ctx, &file),
        Command::Write(msg) => device.write(ctx, &msg),
        Command::Exit(reason) => {
            info!("exit requested: {}", reason.as_deref().unwrap_or("no reason"));
            device.close();
            ctx.queue().flush();
            Ok(())
        }
    }
}

fn fail<D: Decoder>(device: &mut D, status: &Status, e: Error) {
    if e.is_io() {
        device.close();
        status.error.store(true, Ordering::SeqCst);
    }
    error!("{}", e);
}
