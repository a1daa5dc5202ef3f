//! In-memory port for driving a backend without hardware

use crate::port::Port;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

enum Chunk {
    Data(Vec<u8>),
    Timeout,
}

#[derive(Default)]
struct Script {
    input: VecDeque<Chunk>,
    output: Vec<u8>,
    dtr: Vec<bool>,
    closed: bool,
}

/// A scripted device: reads play back queued chunks, writes are recorded
///
/// Clones share the same script, so a test keeps one clone to feed input
/// and inspect output while the backend owns another.
#[derive(Clone, Default)]
pub struct ScriptedPort {
    script: Arc<Mutex<Script>>,
}

impl ScriptedPort {
    pub fn new() -> ScriptedPort {
        ScriptedPort::default()
    }

    /// Queue bytes to be returned by the next read
    pub fn feed(&self, data: impl AsRef<[u8]>) {
        let data = data.as_ref().to_vec();
        if !data.is_empty() {
            self.script.lock().input.push_back(Chunk::Data(data));
        }
    }

    /// Queue a read timeout
    pub fn timeout(&self) {
        self.script.lock().input.push_back(Chunk::Timeout);
    }

    /// Everything written so far
    pub fn written(&self) -> Vec<u8> {
        self.script.lock().output.clone()
    }

    /// Written bytes as text, for line protocols
    pub fn written_str(&self) -> String {
        crate::port::decode(&self.written())
    }

    /// Forget recorded output
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.script.lock().output)
    }

    /// Every level the DTR line was driven to, in order
    pub fn dtr(&self) -> Vec<bool> {
        self.script.lock().dtr.clone()
    }

    /// True once the owner shut the port down
    pub fn closed(&self) -> bool {
        self.script.lock().closed
    }

    /// True when every queued chunk has been read
    pub fn drained(&self) -> bool {
        self.script.lock().input.is_empty()
    }

    pub fn boxed(&self) -> Box<dyn Port> {
        Box::new(self.clone())
    }
}

impl Read for ScriptedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut script = self.script.lock();
        match script.input.pop_front() {
            Some(Chunk::Data(mut data)) => {
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    script.input.push_front(Chunk::Data(data.split_off(n)));
                }
                Ok(n)
            }
            Some(Chunk::Timeout) => Err(io::ErrorKind::TimedOut.into()),
            None => {
                // an idle line still takes time to time out
                drop(script);
                thread::sleep(Duration::from_millis(2));
                Err(io::ErrorKind::TimedOut.into())
            }
        }
    }
}

impl Write for ScriptedPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut script = self.script.lock();
        if script.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        script.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for ScriptedPort {
    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.script.lock().dtr.push(level);
        Ok(())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.script.lock().closed = true;
        Ok(())
    }
}
