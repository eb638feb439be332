//! DEPCMD / DGCMD command channel
//!
//! Both command registers follow the same act-and-poll protocol:
//!
//! 1. write the parameter registers
//! 2. write the opcode with `CMDACT` set
//! 3. poll until the core clears `CMDACT`
//! 4. read the completion status
//!
//! Polling is bounded by the configured command timeout. Any status other
//! than OK is returned as [`UsbError::CommandFailed`].
//!
//! # Usage
//!
//! ```ignore
//! let cmd = CommandChannel::new(&regs, &clock, config.cmd_timeout_us);
//! let rsc = cmd.dep_cmd(phys, DepCmd::StartTransfer, DepCmdParams::trb(addr))?;
//! cmd.dep_cmd(phys, DepCmd::UpdateTransfer { rsc }, DepCmdParams::default())?;
//! ```

use super::regs::*;
use crate::{
    error::{UsbError, UsbResult},
    mmio::{field_get, RegisterBlock},
    timer::{poll_until, Clock},
};

/// Endpoint commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepCmd {
    /// DEPCFG: configure type, max packet size, burst and FIFO
    SetEpConfig,
    /// DEPXFERCFG: allocate one transfer resource
    SetTransferResource,
    SetStall,
    ClearStall,
    /// Start a transfer at the TRB given in the parameters
    StartTransfer,
    /// Tell the core more TRBs are ready for the running transfer
    UpdateTransfer { rsc: u8 },
    /// Stop the running transfer
    EndTransfer { rsc: u8, force: bool },
    /// DEPSTARTCFG: reset the transfer resource allocation base
    StartConfig { rsc_base: u8 },
}

impl DepCmd {
    /// Command register value, `CMDACT` excluded
    pub fn encode(self) -> u32 {
        let param = |p: u8| (p as u32) << DEPCMD_PARAM_POS;
        match self {
            Self::SetEpConfig => DEPCMD_SETEPCONFIG,
            Self::SetTransferResource => DEPCMD_SETTRANSFRESOURCE,
            Self::SetStall => DEPCMD_SETSTALL,
            Self::ClearStall => DEPCMD_CLEARSTALL,
            Self::StartTransfer => DEPCMD_STARTTRANSFER,
            Self::UpdateTransfer { rsc } => DEPCMD_UPDATETRANSFER | param(rsc),
            Self::EndTransfer { rsc, force } => {
                let mut cmd = DEPCMD_ENDTRANSFER | param(rsc);
                if force {
                    cmd |= DEPCMD_HIPRI_FORCERM;
                }
                cmd
            }
            Self::StartConfig { rsc_base } => DEPCMD_DEPSTARTCFG | param(rsc_base),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SetEpConfig => "DepCfg",
            Self::SetTransferResource => "DepXferCfg",
            Self::SetStall => "DepSetStall",
            Self::ClearStall => "DepCStall",
            Self::StartTransfer => "DepStartXfer",
            Self::UpdateTransfer { .. } => "DepUpdateXfer",
            Self::EndTransfer { .. } => "DepEndXfer",
            Self::StartConfig { .. } => "DepStartCfg",
        }
    }
}

/// DEPCMDPAR0..2 contents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DepCmdParams {
    pub param0: u32,
    pub param1: u32,
    pub param2: u32,
}

impl DepCmdParams {
    pub const fn new(param0: u32, param1: u32) -> Self {
        Self {
            param0,
            param1,
            param2: 0,
        }
    }

    /// StartTransfer parameters: TRB address high word, then low word
    pub const fn trb(addr: u64) -> Self {
        Self::new((addr >> 32) as u32, addr as u32)
    }
}

/// Act-and-poll access to the DEPCMD and DGCMD registers
pub struct CommandChannel<'a, R: RegisterBlock + ?Sized, C: Clock + ?Sized> {
    regs: &'a R,
    clock: &'a C,
    timeout_us: u64,
}

impl<'a, R: RegisterBlock + ?Sized, C: Clock + ?Sized> CommandChannel<'a, R, C> {
    pub fn new(regs: &'a R, clock: &'a C, timeout_us: u64) -> Self {
        Self {
            regs,
            clock,
            timeout_us,
        }
    }

    /// Issue an endpoint command on physical endpoint `phys`.
    ///
    /// Returns the transfer resource index the core reports, which is only
    /// meaningful after [`DepCmd::StartTransfer`].
    pub fn dep_cmd(&self, phys: u8, cmd: DepCmd, params: DepCmdParams) -> UsbResult<u8> {
        let opcode = cmd.encode();

        self.regs.write32(depcmdpar0(phys), params.param0);
        self.regs.write32(depcmdpar1(phys), params.param1);
        self.regs.write32(depcmdpar2(phys), params.param2);
        self.regs.write32(depcmd(phys), opcode | DEPCMD_CMDACT);

        poll_until(self.clock, self.timeout_us, cmd.name(), || {
            self.regs.read32(depcmd(phys)) & DEPCMD_CMDACT == 0
        })?;

        let reg = self.regs.read32(depcmd(phys));
        let status = field_get(reg, DEPCMD_STATUS_MASK, DEPCMD_STATUS_POS);
        if status != DEPCMD_STATUS_OK {
            log::error!(
                "[DWC3] ep{} {} failed, status {}{}",
                phys,
                cmd.name(),
                status,
                if status == DEPCMD_STATUS_CMDERR {
                    " (CMDERR)"
                } else {
                    ""
                }
            );
            return Err(UsbError::CommandFailed {
                command: opcode,
                status,
            });
        }

        log::trace!("[DWC3] ep{} {} ok", phys, cmd.name());
        Ok(field_get(reg, DEPCMD_RSCIDX_MASK, DEPCMD_PARAM_POS) as u8)
    }

    /// Issue a device-global command.
    pub fn gen_cmd(&self, cmd: u32, param: u32) -> UsbResult<()> {
        self.regs.write32(DGCMDPAR, param);
        self.regs.write32(DGCMD, cmd | DGCMD_CMDACT);

        poll_until(self.clock, self.timeout_us, "DGCMD", || {
            self.regs.read32(DGCMD) & DGCMD_CMDACT == 0
        })?;

        let status = field_get(self.regs.read32(DGCMD), DGCMD_STATUS_MASK, DGCMD_STATUS_POS);
        if status != 0 {
            log::error!("[DWC3] DGCMD 0x{:02x} failed, status {}", cmd, status);
            return Err(UsbError::CommandFailed {
                command: cmd,
                status,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicBool, Ordering};

    use alloc::sync::Arc;

    use super::*;
    use crate::sim::{SimClock, SimRegs};

    /// Core that completes every command at once, optionally with CMDERR
    fn responsive_core(fail: Arc<AtomicBool>) -> SimRegs {
        let regs = SimRegs::new();
        regs.on_write(move |map, off, value, _| {
            if (0xc80c..0xc80c + 32 * 0x10).contains(&off) && (off - 0xc80c) % 0x10 == 0 {
                let mut done = value & !DEPCMD_CMDACT;
                if value & DEPCMD_CMD_MASK == DEPCMD_STARTTRANSFER {
                    done |= 0x5 << DEPCMD_PARAM_POS;
                }
                if fail.load(Ordering::SeqCst) {
                    done |= DEPCMD_STATUS_CMDERR << DEPCMD_STATUS_POS;
                }
                map.insert(off, done);
            } else if off == DGCMD {
                map.insert(off, value & !DGCMD_CMDACT);
            }
        });
        regs
    }

    #[test]
    fn test_encode() {
        assert_eq!(DepCmd::SetStall.encode(), 4);
        assert_eq!(DepCmd::UpdateTransfer { rsc: 3 }.encode(), 7 | (3 << 16));
        assert_eq!(
            DepCmd::EndTransfer { rsc: 2, force: true }.encode(),
            8 | (2 << 16) | (1 << 11)
        );
        assert_eq!(DepCmd::StartConfig { rsc_base: 2 }.encode(), 9 | (2 << 16));
    }

    #[test]
    fn test_start_transfer_returns_resource_index() {
        let regs = responsive_core(Arc::new(AtomicBool::new(false)));
        let clock = SimClock::new();
        let cmd = CommandChannel::new(&regs, &clock, 100);

        let rsc = cmd
            .dep_cmd(3, DepCmd::StartTransfer, DepCmdParams::trb(0x1_0000_2000))
            .unwrap();
        assert_eq!(rsc, 5);
        assert_eq!(regs.peek(depcmdpar0(3)), 0x1);
        assert_eq!(regs.peek(depcmdpar1(3)), 0x2000);
        assert_eq!(regs.writes_to(depcmd(3)), [DEPCMD_STARTTRANSFER | DEPCMD_CMDACT]);
    }

    #[test]
    fn test_cmderr_is_propagated() {
        let regs = responsive_core(Arc::new(AtomicBool::new(true)));
        let clock = SimClock::new();
        let cmd = CommandChannel::new(&regs, &clock, 100);

        assert_eq!(
            cmd.dep_cmd(2, DepCmd::SetStall, DepCmdParams::default()),
            Err(UsbError::CommandFailed {
                command: DEPCMD_SETSTALL,
                status: DEPCMD_STATUS_CMDERR
            })
        );
    }

    #[test]
    fn test_stuck_command_times_out() {
        let regs = SimRegs::new();
        let clock = SimClock::new();
        let cmd = CommandChannel::new(&regs, &clock, 50);

        let ret = cmd.dep_cmd(0, DepCmd::ClearStall, DepCmdParams::default());
        assert!(matches!(ret, Err(UsbError::Timeout { .. })));

        regs.on_write(|map, off, value, _| {
            if off == DGCMD {
                map.insert(off, value & !DGCMD_CMDACT);
            }
        });
        assert!(cmd.gen_cmd(DGCMD_ALL_FIFO_FLUSH, 0).is_ok());
        assert_eq!(regs.writes_to(DGCMD), [DGCMD_ALL_FIFO_FLUSH | DGCMD_CMDACT]);
    }
}
