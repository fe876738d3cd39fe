//! Request/reply transport between the two CPUs.
//!
//! ```text
//!   sender                                   receiver
//!   send_cmd ── cmd, payload, sync IRQ ──►   ISR wakes the dispatcher
//!                                            dispatcher: decode, handle
//!   woken   ◄── RESP|cmd, result, sync IRQ ─ dispatcher
//! ```
//!
//! The sync ISR only wakes a dispatcher thread, which plays the part of the
//! CPU's IRQ context: it drains complete messages from the receive FIFO,
//! runs incoming commands through the [`CommandHandler`] and hands replies
//! to the task blocked in [`PxiDriver::send_cmd`].

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
};

use tracing::{debug, error, info};

use super::ipc::{CommandHandler, IPC_CMD_RESP_FLAG, IPC_MAX_PARAMS, IpcCmd, IpcRequest};
use crate::{
    error::{Error, Result},
    hardware::{
        pxi::{
            Cpu, PXI_CNT_EN_FIFOS, PXI_CNT_FIFO_ERROR, PXI_CNT_FLUSH_SEND, PXI_CNT_RECV_EMPTY,
            PXI_CNT_SEND_FULL, PXI_SYNC_IRQ, PXI_SYNC_IRQ_EN, PxiPort,
        },
        shared::{clean_dcache_range, flush_dcache_range, invalidate_dcache_range},
    },
    kernel::{Event, Irq, IrqController, IsrRegistration, spin_until},
};

const HANDSHAKE_ARM9: u32 = 0x99;
const HANDSHAKE_ARM11: u32 = 0x11;

fn send_word(port: &PxiPort, word: u32) {
    spin_until(|| port.cnt() & PXI_CNT_SEND_FULL == 0);
    port.send(word);
}

fn recv_word(port: &PxiPort) -> u32 {
    spin_until(|| port.cnt() & PXI_CNT_RECV_EMPTY == 0);
    port.recv()
}

fn fifo_error(port: &PxiPort) -> bool {
    port.cnt() & PXI_CNT_FIFO_ERROR != 0
}

fn send_sync_request(port: &PxiPort) {
    port.set_sync(PXI_SYNC_IRQ_EN | PXI_SYNC_IRQ);
}

/// Tells the other CPU this one is dying. Takes no lock and does not wait
/// for the reply, usable from any context.
pub fn send_panic_cmd(port: &PxiPort, cmd: IpcCmd) {
    send_word(port, cmd.word());
    send_sync_request(port);
}

#[derive(Default)]
struct Reply {
    last: Option<(u32, u32)>,
    closed: bool,
}

struct Link {
    port: PxiPort,
    /// Keeps the words of one message together in the send FIFO.
    send_lock: Mutex<()>,
    /// One command in flight per CPU.
    cmd_lock: Mutex<()>,
    reply: Mutex<Reply>,
    reply_cond: Condvar,
}

impl Link {
    fn reply(&self) -> MutexGuard<'_, Reply> {
        self.reply.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spins on a full send FIFO with `send_lock` held. The two dispatchers
    /// cannot end up waiting on each other: a dispatcher replies only after
    /// reading the whole command, and `cmd_lock` keeps the peer from queuing
    /// the next one before that reply arrived. So the FIFO a replying
    /// dispatcher writes to holds at most one 2-word reply and a panic word,
    /// and the largest message (16 words) fits
    /// [`crate::hardware::pxi::PXI_FIFO_DEPTH`] on its own.
    fn send_message(&self, words: &[u32]) {
        let _guard = self.send_lock.lock().unwrap_or_else(PoisonError::into_inner);
        for &w in words {
            send_word(&self.port, w);
        }
        send_sync_request(&self.port);
    }

    /// Reads and handles everything queued. Returns `false` after a fatal
    /// protocol error.
    fn drain(&self, handler: &dyn CommandHandler) -> bool {
        while self.port.cnt() & PXI_CNT_RECV_EMPTY == 0 {
            let word = self.port.recv();
            if word & IPC_CMD_RESP_FLAG != 0 {
                let result = recv_word(&self.port);
                self.reply().last = Some((word, result));
                self.reply_cond.notify_all();
                continue;
            }

            let cmd = IpcCmd::from_word(word);
            let words = cmd.words();
            if words > IPC_MAX_PARAMS {
                handler.protocol_error(&format!("{cmd:?} carries {words} words"));
                return false;
            }
            let req = IpcRequest {
                cmd,
                words: (0..words).map(|_| recv_word(&self.port)).collect(),
            };
            if fifo_error(&self.port) {
                handler.protocol_error("receive FIFO error");
                return false;
            }

            debug!("{:?}: handling {cmd:?}", self.port.cpu());
            req.invalidate_send_bufs();
            let Some(result) = handler.handle(&req) else {
                handler.protocol_error(&format!("unknown command {cmd:?}"));
                return false;
            };
            req.flush_recv_bufs();
            self.send_message(&[cmd.resp_word(), result]);
        }
        true
    }
}

/// One CPU's end of the PXI link.
pub struct PxiDriver {
    link: Arc<Link>,
    wake: Arc<Event>,
    dispatcher: Option<JoinHandle<()>>,
    _sync_isr: IsrRegistration,
}

impl PxiDriver {
    /// Resets the FIFOs, shakes hands with the other CPU and starts
    /// serving commands with `handler`. Blocks until the other side has
    /// run its own `init`.
    ///
    /// # Errors
    /// If the sync IRQ already has a handler.
    pub fn init(port: PxiPort, irq: &Arc<IrqController>, handler: Arc<dyn CommandHandler>) -> Result<Self> {
        port.set_sync(PXI_SYNC_IRQ_EN);
        port.set_cnt(PXI_CNT_EN_FIFOS | PXI_CNT_FIFO_ERROR | PXI_CNT_FLUSH_SEND);

        match port.cpu() {
            Cpu::Arm9 => {
                send_word(&port, HANDSHAKE_ARM9);
                while recv_word(&port) != HANDSHAKE_ARM11 {}
            }
            Cpu::Arm11 => {
                while recv_word(&port) != HANDSHAKE_ARM9 {}
                send_word(&port, HANDSHAKE_ARM11);
            }
        }
        info!("{:?}: PXI link up", port.cpu());

        let link = Arc::new(Link {
            port,
            send_lock: Mutex::new(()),
            cmd_lock: Mutex::new(()),
            reply: Mutex::new(Reply::default()),
            reply_cond: Condvar::new(),
        });
        let wake = Event::new();

        let dispatcher = {
            let link = Arc::clone(&link);
            let wake = Arc::clone(&wake);
            thread::Builder::new()
                .name(format!("{:?} pxi", link.port.cpu()).to_lowercase())
                .spawn(move || {
                    while wake.wait().is_ok() {
                        wake.clear();
                        if !link.drain(handler.as_ref()) {
                            break;
                        }
                    }
                    link.reply().closed = true;
                    link.reply_cond.notify_all();
                })?
        };

        let isr_wake = Arc::clone(&wake);
        let sync_isr = irq.register(Irq::PxiSync, move |_| isr_wake.signal())?;
        // A request may have arrived between the handshake and registration.
        wake.signal();

        Ok(Self {
            link,
            wake,
            dispatcher: Some(dispatcher),
            _sync_isr: sync_isr,
        })
    }

    #[must_use]
    pub fn port(&self) -> &PxiPort {
        &self.link.port
    }

    /// Sends `cmd` with its payload and blocks until the other CPU replied.
    /// Returns the result word.
    ///
    /// There is no timeout, an unresponsive peer is fatal anyway.
    ///
    /// # Errors
    /// [`Error::InvalidArg`] if `buf` does not match the command shape,
    /// [`Error::EventDeleted`] if this end was shut down while waiting.
    pub fn send_cmd(&self, cmd: IpcCmd, buf: &[u32]) -> Result<u32> {
        if buf.len() > IPC_MAX_PARAMS || buf.len() != cmd.words() {
            return Err(Error::InvalidArg("PXI payload does not match command"));
        }
        let req = IpcRequest {
            cmd,
            words: buf.to_vec(),
        };
        for i in 0..cmd.send_bufs() {
            let b = req.send_buf(i);
            clean_dcache_range(b.addr, b.size as usize);
        }
        for i in 0..cmd.recv_bufs() {
            let b = req.recv_buf(i);
            flush_dcache_range(b.addr, b.size as usize);
        }

        let _cmd_guard = self.link.cmd_lock.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut reply = self.link.reply();
            if reply.closed {
                return Err(Error::EventDeleted);
            }
            reply.last = None;
        }

        let mut words = Vec::with_capacity(buf.len() + 1);
        words.push(cmd.word());
        words.extend_from_slice(buf);
        self.link.send_message(&words);

        let want = cmd.resp_word();
        let result = {
            let mut reply = self
                .link
                .reply_cond
                .wait_while(self.link.reply(), |r| {
                    !r.closed && r.last.is_none_or(|(w, _)| w != want)
                })
                .unwrap_or_else(PoisonError::into_inner);
            match reply.last.take() {
                Some((_, result)) => result,
                None => return Err(Error::EventDeleted),
            }
        };

        // Prefetches may have pulled stale lines in while waiting.
        for i in 0..cmd.recv_bufs() {
            let b = req.recv_buf(i);
            invalidate_dcache_range(b.addr, b.size as usize);
        }
        Ok(result)
    }

    /// Stops serving commands. A task blocked in [`Self::send_cmd`] gets
    /// [`Error::EventDeleted`].
    pub fn close(&self) {
        self.wake.delete();
    }

    fn shutdown(&mut self) {
        self.close();
        if let Some(h) = self.dispatcher.take() {
            let _ = h.join().map_err(|_| error!("PXI dispatcher panicked"));
        }
    }
}

impl Drop for PxiDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
