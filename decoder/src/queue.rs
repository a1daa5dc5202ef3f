//! FIFO command queue with a count of unfinished commands

use crate::Command;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    done: Condvar,
}

/// Shared between the device handle and its thread
#[derive(Clone)]
pub struct Queue {
    sender: flume::Sender<Command>,
    receiver: flume::Receiver<Command>,
    pending: Arc<Pending>,
}

impl Queue {
    pub fn new() -> Queue {
        let (sender, receiver) = flume::unbounded();
        Queue {
            sender,
            receiver,
            pending: Arc::new(Pending::default()),
        }
    }

    pub fn push(&self, cmd: Command) {
        *self.pending.count.lock() += 1;
        // both ends live in self, so the channel cannot be disconnected
        let _ = self.sender.send(cmd);
    }

    /// Block until a command arrives
    pub fn pop(&self) -> Option<Command> {
        self.receiver.recv().ok()
    }

    pub fn try_pop(&self) -> Option<Command> {
        self.receiver.try_recv().ok()
    }

    /// Mark one popped command as finished
    pub fn done(&self) {
        let mut count = self.pending.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.pending.done.notify_all();
        }
    }

    /// Discard every queued command
    pub fn flush(&self) -> usize {
        let mut n = 0;
        while self.receiver.try_recv().is_ok() {
            self.done();
            n += 1;
        }
        return n;
    }

    /// Block until every pushed command has been finished
    pub fn join(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.done.wait(&mut count);
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Default for Queue {
    fn default() -> Queue {
        Queue::new()
    }
}
