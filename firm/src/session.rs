//! Both CPUs run from the host.
//!
//! ```text
//!  ┌──────────────┐   PXI    ┌─────────────────────────┐   commands   ┌───────────┐
//!  │ ARM9 thread  │ ◄──────► │ ARM11 thread            │ ◄─────────── │  Session  │
//!  │  Arm9::run   │          │  Arm11 + legacy source  │ ───────────► │  (caller) │
//!  └──────────────┘          └─────────────────────────┘    events    └───────────┘
//! ```
//!
//! The caller talks to the ARM11 thread through two lock-free SPSC queues.
//! The ARM11 thread also owns the legacy video source and pushes one frame
//! at a time, waiting until the frame handler presented it.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
    arm9::Arm9,
    arm11::{Arm11, BootOptions},
    error::{Error, Result},
    fs::FileSystem,
    hardware::{
        Soc,
        legacy::{LEGACY_REFRESH_HZ, LegacyVideo},
    },
    hid::HidKeys,
    save_type::SaveType,
};

const COMMAND_BUFFER_SIZE: usize = 16;
const EVENT_BUFFER_SIZE: usize = 64;

/// A frame that is not presented within this time means the pipeline hangs.
const STALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Push frames until this many more were presented.
    RunFrames(u64),
    SetKeys { keys: HidKeys, pressed: bool },
    Sleep,
    Wake,
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Booted(BootInfo),
    /// A `RunFrames` finished, with the total frames presented so far.
    FramesShown(u64),
    Asleep,
    Awake,
    /// Boot or the running title failed. The ARM11 stopped.
    Failed(String),
    Stopped(SessionReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootInfo {
    pub save_type: SaveType,
    pub rom_size: usize,
    pub scaler: u8,
    pub color_corrected: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub frames: u64,
    pub screenshots: u64,
}

struct Arm11Thread {
    soc: Soc,
    arm11: Arm11,
    source: LegacyVideo,
    cmd_rx: rtrb::Consumer<SessionCommand>,
    event_tx: rtrb::Producer<SessionEvent>,

    frames_remaining: u64,
    asleep: bool,
}

impl Arm11Thread {
    fn run(mut self) {
        loop {
            match self.process_commands() {
                Ok(false) => {}
                Ok(true) => break,
                Err(e) => return self.fail(&e),
            }

            if self.frames_remaining > 0 {
                if let Err(e) = self.present_frame() {
                    return self.fail(&e);
                }
                self.frames_remaining -= 1;
                if self.frames_remaining == 0 {
                    let shown = self.arm11.video().stats().frames();
                    self.send_event(SessionEvent::FramesShown(shown));
                }
            } else {
                thread::sleep(Duration::from_millis(1));
            }
        }

        let report = self.report();
        if let Err(e) = self.arm11.shutdown() {
            error!("session: shutdown: {e}");
        }
        info!("session: stopped after {} frames", report.frames);
        let _ = self.event_tx.push(SessionEvent::Stopped(report));
    }

    /// Returns `true` on shutdown.
    fn process_commands(&mut self) -> Result<bool> {
        while let Ok(cmd) = self.cmd_rx.pop() {
            debug!("session: {cmd:?}");
            match cmd {
                SessionCommand::RunFrames(n) => self.frames_remaining += n,
                SessionCommand::SetKeys { keys, pressed } => {
                    if pressed {
                        self.soc.keypad.press(keys);
                    } else {
                        self.soc.keypad.release(keys);
                    }
                }
                SessionCommand::Sleep => {
                    if !self.asleep {
                        self.arm11.sleep();
                        self.asleep = true;
                    }
                    self.send_event(SessionEvent::Asleep);
                }
                SessionCommand::Wake => {
                    if self.asleep {
                        self.arm11.wake()?;
                        self.asleep = false;
                    }
                    self.send_event(SessionEvent::Awake);
                }
                SessionCommand::Shutdown => return Ok(true),
            }
        }
        Ok(false)
    }

    /// Outputs legacy frames until one more was presented. While asleep the
    /// frame goes nowhere.
    fn present_frame(&mut self) -> Result<()> {
        if self.asleep {
            self.source.step(&self.soc.lgycap);
            return Ok(());
        }

        let stats = Arc::clone(self.arm11.video().stats());
        let before = stats.frames();
        let period = Duration::from_secs_f64(1.0 / LEGACY_REFRESH_HZ);
        let deadline = Instant::now() + STALL_TIMEOUT;
        loop {
            if let Some(what) = self.arm11.peer_halt() {
                return Err(Error::Halted(format!("ARM9 {what}")));
            }
            // A screenshot swallows one extra frame, keep feeding.
            self.source.step(&self.soc.lgycap);
            let next = Instant::now() + period;
            while Instant::now() < next {
                if stats.frames() > before {
                    return Ok(());
                }
                thread::sleep(Duration::from_millis(1));
            }
            if Instant::now() > deadline {
                return Err(Error::Halted("video pipeline stalled".into()));
            }
        }
    }

    fn report(&self) -> SessionReport {
        let stats = self.arm11.video().stats();
        SessionReport {
            frames: stats.frames(),
            screenshots: stats.screenshots(),
        }
    }

    fn fail(mut self, e: &Error) {
        error!("session: {e}");
        let report = self.report();
        self.send_event(SessionEvent::Failed(e.to_string()));
        let _ = self.arm11.abort(&e.to_string());
        let _ = self.event_tx.push(SessionEvent::Stopped(report));
    }

    /// Non-blocking, drops the event if the queue is full.
    fn send_event(&mut self, event: SessionEvent) {
        if self.event_tx.push(event).is_err() {
            warn!("session: event queue full");
        }
    }
}

/// Handle of a running session.
pub struct Session {
    soc: Soc,
    cmd_tx: rtrb::Producer<SessionCommand>,
    event_rx: rtrb::Consumer<SessionEvent>,
    arm9: Option<JoinHandle<Result<()>>>,
    arm11: Option<JoinHandle<()>>,
    info: BootInfo,
}

impl Session {
    /// Boots both CPUs and waits until the title runs.
    ///
    /// # Errors
    /// [`Error::Halted`] with the boot failure, thread spawn failures.
    pub fn start(fs: Arc<dyn FileSystem>, opts: BootOptions, source: LegacyVideo) -> Result<Self> {
        let soc = Soc::new();
        let (cmd_tx, cmd_rx) = rtrb::RingBuffer::new(COMMAND_BUFFER_SIZE);
        let (mut event_tx, event_rx) = rtrb::RingBuffer::new(EVENT_BUFFER_SIZE);

        let arm9 = {
            let soc = soc.clone();
            let fs = Arc::clone(&fs);
            thread::Builder::new()
                .name("arm9".into())
                .spawn(move || Arm9::boot(&soc, fs)?.run())?
        };

        let arm11 = {
            let soc = soc.clone();
            thread::Builder::new().name("arm11".into()).spawn(move || {
                let arm11 = match Arm11::boot(&soc, fs, &opts) {
                    Ok(arm11) => arm11,
                    Err(e) => {
                        let _ = event_tx.push(SessionEvent::Failed(e.to_string()));
                        return;
                    }
                };
                let info = BootInfo {
                    save_type: arm11.save_type(),
                    rom_size: arm11.rom_size(),
                    scaler: arm11.config().scaler,
                    color_corrected: arm11.video().color_corrected(),
                };
                let _ = event_tx.push(SessionEvent::Booted(info));
                Arm11Thread {
                    soc,
                    arm11,
                    source,
                    cmd_rx,
                    event_tx,
                    frames_remaining: 0,
                    asleep: false,
                }
                .run();
            })?
        };

        let mut session = Self {
            soc,
            cmd_tx,
            event_rx,
            arm9: Some(arm9),
            arm11: Some(arm11),
            info: BootInfo {
                save_type: SaveType::None,
                rom_size: 0,
                scaler: 0,
                color_corrected: false,
            },
        };
        match session.wait_event() {
            Some(SessionEvent::Booted(info)) => {
                info!("session: booted, {info:?}");
                session.info = info;
                Ok(session)
            }
            Some(SessionEvent::Failed(reason)) => {
                session.join();
                Err(Error::Halted(reason))
            }
            other => {
                session.join();
                Err(Error::Halted(format!("unexpected boot result {other:?}")))
            }
        }
    }

    #[must_use]
    pub const fn info(&self) -> &BootInfo {
        &self.info
    }

    /// The simulated console, for inspecting the screens.
    #[must_use]
    pub const fn soc(&self) -> &Soc {
        &self.soc
    }

    /// Queues a command. Commands sent to a stopped session are dropped.
    pub fn send(&mut self, cmd: SessionCommand) {
        if self.cmd_tx.push(cmd).is_err() {
            warn!("session: command queue full");
        }
    }

    /// Next event, if any.
    pub fn poll(&mut self) -> Option<SessionEvent> {
        self.event_rx.pop().ok()
    }

    /// Blocks until the next event. `None` once the ARM11 thread ended and
    /// every event was read.
    pub fn wait_event(&mut self) -> Option<SessionEvent> {
        loop {
            if let Ok(ev) = self.event_rx.pop() {
                return Some(ev);
            }
            if self.arm11.as_ref().is_none_or(JoinHandle::is_finished) {
                return self.event_rx.pop().ok();
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Runs `n` frames. Returns the total number of frames presented.
    ///
    /// # Errors
    /// [`Error::Halted`] if the session failed meanwhile.
    pub fn run_frames(&mut self, n: u64) -> Result<u64> {
        self.send(SessionCommand::RunFrames(n));
        loop {
            match self.wait_event() {
                Some(SessionEvent::FramesShown(total)) => return Ok(total),
                Some(SessionEvent::Failed(reason)) => return Err(Error::Halted(reason)),
                Some(ev) => debug!("session: {ev:?}"),
                None => return Err(Error::Halted("session stopped".into())),
            }
        }
    }

    /// Shuts both CPUs down and returns what was shown.
    ///
    /// # Errors
    /// [`Error::Halted`] if the session had failed or the ARM9 halted.
    pub fn finish(mut self) -> Result<SessionReport> {
        self.send(SessionCommand::Shutdown);
        let mut failure = None;
        let mut report = None;
        while let Some(ev) = self.wait_event() {
            match ev {
                SessionEvent::Failed(reason) => failure = Some(reason),
                SessionEvent::Stopped(r) => report = Some(r),
                _ => {}
            }
        }
        let arm9 = self.join();
        if let Some(reason) = failure {
            return Err(Error::Halted(reason));
        }
        arm9?;
        report.ok_or_else(|| Error::Halted("session ended without a report".into()))
    }

    fn join(&mut self) -> Result<()> {
        if let Some(h) = self.arm11.take() {
            let _ = h.join().map_err(|_| error!("session: ARM11 thread panicked"));
        }
        match self.arm9.take().map(JoinHandle::join) {
            Some(Ok(res)) => res,
            Some(Err(_)) => Err(Error::Halted("ARM9 thread panicked".into())),
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.cmd_tx.push(SessionCommand::Shutdown);
        let _ = self.join();
    }
}
