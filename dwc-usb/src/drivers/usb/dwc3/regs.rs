//! DWC3 register map
//!
//! Offsets are relative to the start of the xHCI/global register window, so
//! the global block begins at `0xc100` as in the databook.

#![allow(dead_code)]

// ---------------------------------------------------------------------------
// Global registers
// ---------------------------------------------------------------------------

pub const GSBUSCFG0: usize = 0xc100;
pub const GCTL: usize = 0xc110;
pub const GSNPSID: usize = 0xc120;
pub const GUSB2PHYCFG0: usize = 0xc200;
pub const GUSB3PIPECTL0: usize = 0xc2c0;
pub const GTXFIFOSIZ0: usize = 0xc300;
pub const GRXFIFOSIZ0: usize = 0xc380;

pub const fn gusb2phycfg(n: usize) -> usize {
    GUSB2PHYCFG0 + n * 4
}

pub const fn gusb3pipectl(n: usize) -> usize {
    GUSB3PIPECTL0 + n * 4
}

pub const fn gtxfifosiz(n: usize) -> usize {
    GTXFIFOSIZ0 + n * 4
}

pub const fn grxfifosiz(n: usize) -> usize {
    GRXFIFOSIZ0 + n * 4
}

// GSBUSCFG0 burst enables
pub const GSBUSCFG0_INCR4BRSTENA: u32 = 1 << 1;
pub const GSBUSCFG0_INCR8BRSTENA: u32 = 1 << 2;
pub const GSBUSCFG0_INCR16BRSTENA: u32 = 1 << 3;
pub const GSBUSCFG0_BRST_MASK: u32 = 0xff;

// GCTL
pub const GCTL_CORESOFTRESET: u32 = 1 << 11;
pub const GCTL_PRTCAPDIR_MASK: u32 = 0x3 << 12;
pub const GCTL_PRTCAPDIR_POS: u32 = 12;
pub const GCTL_PRTCAP_HOST: u32 = 1;
pub const GCTL_PRTCAP_DEVICE: u32 = 2;
pub const GCTL_DSBLCLKGTNG: u32 = 1 << 0;

// GSNPSID
pub const GSNPSID_MASK: u32 = 0xffff_0000;
pub const GSNPSID_USB3: u32 = 0x5533_0000;
pub const GSNPSID_USB31: u32 = 0x3331_0000;

// GUSB2PHYCFG / GUSB3PIPECTL
pub const GUSB2PHYCFG_SUSPHY: u32 = 1 << 6;
pub const GUSB3PIPECTL_SUSPHY: u32 = 1 << 17;

// GTXFIFOSIZ / GRXFIFOSIZ: start address in the upper half, depth below
pub const FIFOSIZ_START_POS: u32 = 16;
pub const FIFOSIZ_DEPTH_MASK: u32 = 0xffff;

// ---------------------------------------------------------------------------
// Event buffer registers
// ---------------------------------------------------------------------------

pub const fn gevntadrlo(n: usize) -> usize {
    0xc400 + n * 0x10
}

pub const fn gevntadrhi(n: usize) -> usize {
    0xc404 + n * 0x10
}

pub const fn gevntsiz(n: usize) -> usize {
    0xc408 + n * 0x10
}

pub const fn gevntcount(n: usize) -> usize {
    0xc40c + n * 0x10
}

pub const GEVNTSIZ_INTMASK: u32 = 1 << 31;
pub const GEVNTSIZ_SIZE_MASK: u32 = 0xffff;
pub const GEVNTCOUNT_MASK: u32 = 0xfffc;

// ---------------------------------------------------------------------------
// Device registers
// ---------------------------------------------------------------------------

pub const DCFG: usize = 0xc700;
pub const DCTL: usize = 0xc704;
pub const DEVTEN: usize = 0xc708;
pub const DSTS: usize = 0xc70c;
pub const DGCMDPAR: usize = 0xc710;
pub const DGCMD: usize = 0xc714;
pub const DALEPENA: usize = 0xc720;

// DCFG
pub const DCFG_DEVSPD_MASK: u32 = 0x7;
pub const DCFG_DEVADDR_MASK: u32 = 0x7f << 3;
pub const DCFG_DEVADDR_POS: u32 = 3;

// Speed encodings shared by DCFG.DEVSPD and DSTS.CONNECTSPD
pub const SPEED_HIGH: u32 = 0;
pub const SPEED_FULL_30_60: u32 = 1;
pub const SPEED_LOW: u32 = 2;
pub const SPEED_FULL_48: u32 = 3;
pub const SPEED_SUPER: u32 = 4;
pub const SPEED_SUPER_PLUS: u32 = 5;

// DCTL
pub const DCTL_RUN_STOP: u32 = 1 << 31;
pub const DCTL_CSFTRST: u32 = 1 << 30;

// DEVTEN
pub const DEVTEN_DISCONNEVTEN: u32 = 1 << 0;
pub const DEVTEN_USBRSTEN: u32 = 1 << 1;
pub const DEVTEN_CONNECTDONEEN: u32 = 1 << 2;
pub const DEVTEN_ULSTCNGEN: u32 = 1 << 3;
pub const DEVTEN_WKUPEVTEN: u32 = 1 << 4;
pub const DEVTEN_ERRTICERREN: u32 = 1 << 9;
pub const DEVTEN_CMDCMPLTEN: u32 = 1 << 10;
pub const DEVTEN_EVNTOVERFLOWEN: u32 = 1 << 11;

/// Device events the driver consumes
pub const DEVTEN_DEFAULT: u32 = DEVTEN_DISCONNEVTEN
    | DEVTEN_USBRSTEN
    | DEVTEN_CONNECTDONEEN
    | DEVTEN_ULSTCNGEN
    | DEVTEN_WKUPEVTEN
    | DEVTEN_ERRTICERREN
    | DEVTEN_EVNTOVERFLOWEN;

// DSTS
pub const DSTS_CONNECTSPD_MASK: u32 = 0x7;
pub const DSTS_DEVCTRLHLT: u32 = 1 << 22;

// DGCMD
pub const DGCMD_CMDACT: u32 = 1 << 10;
pub const DGCMD_CMDIOC: u32 = 1 << 8;
pub const DGCMD_STATUS_POS: u32 = 15;
pub const DGCMD_STATUS_MASK: u32 = 1 << 15;

pub const DGCMD_SET_PERIODIC_PAR: u32 = 0x02;
pub const DGCMD_SELECTED_FIFO_FLUSH: u32 = 0x09;
pub const DGCMD_ALL_FIFO_FLUSH: u32 = 0x0a;

// ---------------------------------------------------------------------------
// Endpoint command registers
// ---------------------------------------------------------------------------

pub const fn depcmdpar2(phys: u8) -> usize {
    0xc800 + phys as usize * 0x10
}

pub const fn depcmdpar1(phys: u8) -> usize {
    0xc804 + phys as usize * 0x10
}

pub const fn depcmdpar0(phys: u8) -> usize {
    0xc808 + phys as usize * 0x10
}

pub const fn depcmd(phys: u8) -> usize {
    0xc80c + phys as usize * 0x10
}

// DEPCMD
pub const DEPCMD_CMD_MASK: u32 = 0xf;
pub const DEPCMD_CMDIOC: u32 = 1 << 8;
pub const DEPCMD_CMDACT: u32 = 1 << 10;
pub const DEPCMD_HIPRI_FORCERM: u32 = 1 << 11;
pub const DEPCMD_STATUS_POS: u32 = 12;
pub const DEPCMD_STATUS_MASK: u32 = 0xf << 12;
pub const DEPCMD_PARAM_POS: u32 = 16;
pub const DEPCMD_PARAM_MASK: u32 = 0xffff << 16;
pub const DEPCMD_RSCIDX_MASK: u32 = 0x7f << 16;

pub const DEPCMD_STATUS_OK: u32 = 0;
pub const DEPCMD_STATUS_CMDERR: u32 = 1;

pub const DEPCMD_SETEPCONFIG: u32 = 1;
pub const DEPCMD_SETTRANSFRESOURCE: u32 = 2;
pub const DEPCMD_SETSTALL: u32 = 4;
pub const DEPCMD_CLEARSTALL: u32 = 5;
pub const DEPCMD_STARTTRANSFER: u32 = 6;
pub const DEPCMD_UPDATETRANSFER: u32 = 7;
pub const DEPCMD_ENDTRANSFER: u32 = 8;
pub const DEPCMD_DEPSTARTCFG: u32 = 9;

// DEPCFG parameter 0
pub const DEPCFG_EP_TYPE_POS: u32 = 1;
pub const DEPCFG_MAX_PACKET_SIZE_POS: u32 = 3;
pub const DEPCFG_FIFO_NUMBER_POS: u32 = 17;
pub const DEPCFG_BURST_SIZE_POS: u32 = 22;
pub const DEPCFG_ACTION_INIT: u32 = 0 << 30;
pub const DEPCFG_ACTION_MODIFY: u32 = 2 << 30;

// DEPCFG parameter 1
pub const DEPCFG_XFER_COMPLETE_EN: u32 = 1 << 8;
pub const DEPCFG_XFER_IN_PROGRESS_EN: u32 = 1 << 9;
pub const DEPCFG_XFER_NOT_READY_EN: u32 = 1 << 10;
pub const DEPCFG_BINTERVAL_M1_POS: u32 = 16;
pub const DEPCFG_EP_NUMBER_POS: u32 = 25;

// DEPXFERCFG parameter 0
pub const DEPXFERCFG_NUM_XFER_RES: u32 = 1;

/// Physical endpoint number for a USB endpoint address
pub const fn phys_ep(addr: u8) -> u8 {
    ((addr & 0x0f) << 1) | ((addr >> 7) & 1)
}

/// USB endpoint address for a physical endpoint number
pub const fn ep_addr(phys: u8) -> u8 {
    (phys >> 1) | ((phys & 1) << 7)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_physical_numbering() {
        assert_eq!(phys_ep(0x00), 0);
        assert_eq!(phys_ep(0x80), 1);
        assert_eq!(phys_ep(0x81), 3);
        assert_eq!(phys_ep(0x02), 4);
        assert_eq!(ep_addr(3), 0x81);
        assert_eq!(ep_addr(4), 0x02);
    }

    #[test]
    fn test_endpoint_register_stride() {
        assert_eq!(depcmd(0), 0xc80c);
        assert_eq!(depcmd(3), 0xc83c);
        assert_eq!(depcmdpar2(1), 0xc810);
        assert_eq!(gevntcount(0), 0xc40c);
    }
}
