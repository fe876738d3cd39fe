//! Command vocabulary spoken over PXI.
//!
//! A command word packs the id and the shape of its payload:
//!
//! ```text
//!  15   14..8   7..6       5..4       3..0
//! [resp][ id ][send bufs][recv bufs][params]
//! ```
//!
//! Buffers travel as `(address, size)` word pairs, send buffers first, then
//! receive buffers, then the plain parameters. A reply repeats the command
//! word with the response bit set, followed by the result word.

use std::fmt;

use crate::hardware::shared::{flush_dcache_range, invalidate_dcache_range};

pub const IPC_MAX_PARAMS: usize = 15;
pub const IPC_CMD_RESP_FLAG: u32 = 1 << 15;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpcCmd(u32);

impl IpcCmd {
    #[must_use]
    pub const fn new(id: u8, send_bufs: u8, recv_bufs: u8, params: u8) -> Self {
        Self(
            (id as u32 & 0x7F) << 8
                | (send_bufs as u32 & 3) << 6
                | (recv_bufs as u32 & 3) << 4
                | (params as u32 & 15),
        )
    }

    /// Decodes a word read from the FIFO. The response bit is dropped.
    #[must_use]
    pub const fn from_word(word: u32) -> Self {
        Self(word & 0x7FFF)
    }

    #[must_use]
    pub const fn word(self) -> u32 {
        self.0
    }

    /// Word a reply to this command starts with.
    #[must_use]
    pub const fn resp_word(self) -> u32 {
        self.0 | IPC_CMD_RESP_FLAG
    }

    #[must_use]
    pub const fn id(self) -> u8 {
        (self.0 >> 8) as u8 & 0x7F
    }

    #[must_use]
    pub const fn send_bufs(self) -> usize {
        (self.0 >> 6 & 3) as usize
    }

    #[must_use]
    pub const fn recv_bufs(self) -> usize {
        (self.0 >> 4 & 3) as usize
    }

    #[must_use]
    pub const fn params(self) -> usize {
        (self.0 & 15) as usize
    }

    /// Payload words following the command word. May exceed
    /// [`IPC_MAX_PARAMS`] for malformed commands.
    #[must_use]
    pub const fn words(self) -> usize {
        self.send_bufs() * 2 + self.recv_bufs() * 2 + self.params()
    }
}

impl fmt::Debug for IpcCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IpcCmd(id {}, {}/{} bufs, {} params)",
            self.id(),
            self.send_bufs(),
            self.recv_bufs(),
            self.params()
        )
    }
}

/// Commands handled by the ARM9. Ids 0..=18 belong to the file system API
/// of the full firmware, which the host model does not route over PXI.
pub mod cmd9 {
    use super::IpcCmd;

    pub const PREPARE_GBA: IpcCmd = IpcCmd::new(19, 1, 0, 2);
    pub const SET_GBA_RTC: IpcCmd = IpcCmd::new(20, 0, 0, 2);
    pub const GET_GBA_RTC: IpcCmd = IpcCmd::new(21, 0, 1, 0);
    pub const BACKUP_GBA_SAVE: IpcCmd = IpcCmd::new(22, 0, 0, 0);
    /// Also what the ARM11 sends when it halts.
    pub const PREPARE_POWER: IpcCmd = IpcCmd::new(23, 0, 0, 0);
}

/// Commands handled by the ARM11.
pub mod cmd11 {
    use super::IpcCmd;

    pub const PRINT_MSG: IpcCmd = IpcCmd::new(0, 0, 0, 0);
    pub const PANIC: IpcCmd = IpcCmd::new(1, 0, 0, 0);
    pub const EXCEPTION: IpcCmd = IpcCmd::new(2, 0, 0, 0);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpcBuffer {
    pub addr: u32,
    pub size: u32,
}

impl IpcBuffer {
    const fn is_set(self) -> bool {
        self.addr != 0 && self.size != 0
    }
}

/// A decoded command with its payload words.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpcRequest {
    pub cmd: IpcCmd,
    pub words: Vec<u32>,
}

impl IpcRequest {
    fn buffer(&self, idx: usize) -> IpcBuffer {
        IpcBuffer {
            addr: self.words.get(idx * 2).copied().unwrap_or(0),
            size: self.words.get(idx * 2 + 1).copied().unwrap_or(0),
        }
    }

    #[must_use]
    pub fn send_buf(&self, i: usize) -> IpcBuffer {
        self.buffer(i)
    }

    #[must_use]
    pub fn recv_buf(&self, i: usize) -> IpcBuffer {
        self.buffer(self.cmd.send_bufs() + i)
    }

    /// Plain parameters after the buffer pairs.
    #[must_use]
    pub fn params(&self) -> &[u32] {
        let start = (self.cmd.send_bufs() + self.cmd.recv_bufs()) * 2;
        self.words.get(start..).unwrap_or_default()
    }

    /// Drops stale cache lines of the buffers the sender filled.
    pub fn invalidate_send_bufs(&self) {
        for i in 0..self.cmd.send_bufs() {
            let b = self.send_buf(i);
            if b.is_set() {
                invalidate_dcache_range(b.addr, b.size as usize);
            }
        }
    }

    /// Writes back the buffers the sender reads after the reply.
    pub fn flush_recv_bufs(&self) {
        for i in 0..self.cmd.recv_bufs() {
            let b = self.recv_buf(i);
            if b.is_set() {
                flush_dcache_range(b.addr, b.size as usize);
            }
        }
    }
}

/// Executes commands arriving from the other CPU.
pub trait CommandHandler: Send + Sync {
    /// Returns the result word sent back, `None` for a command this side
    /// does not know (which halts the CPU).
    fn handle(&self, req: &IpcRequest) -> Option<u32>;

    /// Malformed traffic was received. The link stops serving commands
    /// after this call; implementations halt the CPU.
    fn protocol_error(&self, reason: &str);
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn command_word_layout() {
        assert_eq!(cmd9::PREPARE_GBA.word(), 19 << 8 | 1 << 6 | 2);
        assert_eq!(cmd9::GET_GBA_RTC.word(), 21 << 8 | 1 << 4);
        assert_eq!(cmd9::PREPARE_GBA.words(), 4);
        assert_eq!(cmd9::PREPARE_GBA.resp_word() & IPC_CMD_RESP_FLAG, IPC_CMD_RESP_FLAG);
        assert_eq!(IpcCmd::from_word(cmd9::PREPARE_GBA.resp_word()), cmd9::PREPARE_GBA);
        // Ids up to 127 never reach the response bit.
        assert_eq!(IpcCmd::new(127, 3, 3, 15).word() & IPC_CMD_RESP_FLAG, 0);
    }

    #[test]
    fn oversized_payload_is_visible() {
        let cmd = IpcCmd::new(5, 3, 3, 15);
        assert!(cmd.words() > IPC_MAX_PARAMS);
    }

    #[test]
    fn request_accessors() {
        let req = IpcRequest {
            cmd: cmd9::PREPARE_GBA,
            words: vec![0x1FF8_1000, 12, 1, 14],
        };
        assert_eq!(
            req.send_buf(0),
            IpcBuffer {
                addr: 0x1FF8_1000,
                size: 12
            }
        );
        assert_eq!(req.params(), &[1, 14]);

        let req = IpcRequest {
            cmd: cmd9::GET_GBA_RTC,
            words: vec![0x1FF8_2000, 8],
        };
        assert_eq!(req.recv_buf(0).size, 8);
        assert!(req.params().is_empty());
    }
}
