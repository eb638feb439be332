//! DWC2 register map
//!
//! Only the core, host and host-channel registers used by the host driver.
//! Bit positions follow the OTG databook.

#![allow(dead_code)]

// ---------------------------------------------------------------------------
// Core global registers
// ---------------------------------------------------------------------------

pub const GOTGCTL: usize = 0x000;
pub const GAHBCFG: usize = 0x008;
pub const GUSBCFG: usize = 0x00c;
pub const GRSTCTL: usize = 0x010;
pub const GINTSTS: usize = 0x014;
pub const GINTMSK: usize = 0x018;
pub const GRXFSIZ: usize = 0x024;
pub const GNPTXFSIZ: usize = 0x028;
pub const GSNPSID: usize = 0x040;
pub const GHWCFG1: usize = 0x044;
pub const GHWCFG2: usize = 0x048;
pub const GHWCFG3: usize = 0x04c;
pub const GHWCFG4: usize = 0x050;
pub const GDFIFOCFG: usize = 0x05c;
pub const HPTXFSIZ: usize = 0x100;

// GAHBCFG
pub const GAHBCFG_GLBINTRMASK: u32 = 1 << 0;
pub const GAHBCFG_HBSTLEN_POS: u32 = 1;
pub const GAHBCFG_HBSTLEN_MASK: u32 = 0xf << 1;
pub const GAHBCFG_HBSTLEN_INCR16: u32 = 7;
pub const GAHBCFG_DMAEN: u32 = 1 << 5;
pub const GAHBCFG_NPTXFEMPLVL: u32 = 1 << 7;

// GUSBCFG
pub const GUSBCFG_PHYIF16: u32 = 1 << 3;
pub const GUSBCFG_ULPI_UTMI_SEL: u32 = 1 << 4;
pub const GUSBCFG_PHYSEL_USB11: u32 = 1 << 6;
pub const GUSBCFG_FORCEHSTMODE: u32 = 1 << 29;
pub const GUSBCFG_FORCEDEVMODE: u32 = 1 << 30;

// GRSTCTL
pub const GRSTCTL_CSFTRST: u32 = 1 << 0;
pub const GRSTCTL_RXFFLSH: u32 = 1 << 4;
pub const GRSTCTL_TXFFLSH: u32 = 1 << 5;
pub const GRSTCTL_TXFNUM_POS: u32 = 6;
pub const GRSTCTL_TXFNUM_MASK: u32 = 0x1f << 6;
/// TXFNUM value selecting every TX FIFO
pub const GRSTCTL_TXFNUM_ALL: u32 = 0x10;
pub const GRSTCTL_CSFTRSTDONE: u32 = 1 << 29;
pub const GRSTCTL_AHBIDLE: u32 = 1 << 31;

// GINTSTS / GINTMSK
pub const GINTSTS_CURMOD: u32 = 1 << 0;
pub const GINTSTS_SOF: u32 = 1 << 3;
pub const GINTSTS_PRTINT: u32 = 1 << 24;
pub const GINTSTS_HCHINT: u32 = 1 << 25;
pub const GINTSTS_DISCONNINT: u32 = 1 << 29;

// GSNPSID
pub const GSNPSID_REV_5_00A: u32 = 0x4f54_500a;

// GHWCFG2
pub const GHWCFG2_OTGARCH_POS: u32 = 3;
pub const GHWCFG2_OTGARCH_MASK: u32 = 0x3 << 3;
pub const GHWCFG2_OTGARCH_INTERNALDMA: u32 = 2;
pub const GHWCFG2_HSPHYTYPE_POS: u32 = 6;
pub const GHWCFG2_HSPHYTYPE_MASK: u32 = 0x3 << 6;
pub const GHWCFG2_HSPHYTYPE_UTMIPLUS: u32 = 1;
pub const GHWCFG2_HSPHYTYPE_ULPI: u32 = 2;
pub const GHWCFG2_FSPHYTYPE_POS: u32 = 8;
pub const GHWCFG2_FSPHYTYPE_MASK: u32 = 0x3 << 8;
pub const GHWCFG2_NUMHSTCHNL_POS: u32 = 14;
pub const GHWCFG2_NUMHSTCHNL_MASK: u32 = 0xf << 14;

// GHWCFG3
pub const GHWCFG3_DFIFODEPTH_POS: u32 = 16;
pub const GHWCFG3_DFIFODEPTH_MASK: u32 = 0xffff << 16;

// GHWCFG4
pub const GHWCFG4_PHYDATAWIDTH_POS: u32 = 14;
pub const GHWCFG4_PHYDATAWIDTH_MASK: u32 = 0x3 << 14;
pub const GHWCFG4_DEDFIFOMODE: u32 = 1 << 25;

// GDFIFOCFG
pub const GDFIFOCFG_EPINFOBASEADDR_POS: u32 = 16;

// FIFO size registers: start address in the upper half, depth below
pub const FIFOSIZ_DEPTH_POS: u32 = 16;

// ---------------------------------------------------------------------------
// Host mode registers
// ---------------------------------------------------------------------------

pub const HCFG: usize = 0x400;
pub const HFIR: usize = 0x404;
pub const HFNUM: usize = 0x408;
pub const HAINT: usize = 0x414;
pub const HAINTMSK: usize = 0x418;
pub const HPRT: usize = 0x440;

// HCFG
pub const HCFG_FSLSPCLKSEL_MASK: u32 = 0x3;
pub const HCFG_FSLSPCLKSEL_30_60: u32 = 0;
pub const HCFG_FSLSPCLKSEL_48: u32 = 1;
pub const HCFG_FSLSPCLKSEL_6: u32 = 2;
pub const HCFG_DESCDMA: u32 = 1 << 23;
pub const HCFG_PERSCHEDENA: u32 = 1 << 26;

// HFIR
pub const HFIR_FRINT_MASK: u32 = 0xffff;
pub const HFIR_RLDCTRL: u32 = 1 << 16;
/// PHY clocks per 1 ms frame at 48 MHz
pub const HFIR_FRINT_FS_48: u32 = 48_000;
/// PHY clocks per 1 ms frame at 6 MHz
pub const HFIR_FRINT_LS_6: u32 = 6_000;

// HFNUM
pub const HFNUM_FRNUM_MASK: u32 = 0xffff;
/// The (micro)frame number wraps after this value
pub const HFNUM_MAX_FRNUM: u16 = 0x3fff;

// HPRT
pub const HPRT_CONNSTS: u32 = 1 << 0;
pub const HPRT_CONNDET: u32 = 1 << 1;
pub const HPRT_ENA: u32 = 1 << 2;
pub const HPRT_ENCHNG: u32 = 1 << 3;
pub const HPRT_OVRCURRACT: u32 = 1 << 4;
pub const HPRT_OVRCURRCHNG: u32 = 1 << 5;
pub const HPRT_RST: u32 = 1 << 8;
pub const HPRT_PWR: u32 = 1 << 12;
pub const HPRT_SPD_POS: u32 = 17;
pub const HPRT_SPD_MASK: u32 = 0x3 << 17;
pub const HPRT_SPD_HIGH: u32 = 0;
pub const HPRT_SPD_FULL: u32 = 1;
pub const HPRT_SPD_LOW: u32 = 2;

/// HPRT bits cleared by writing one. Read-modify-write of HPRT must mask
/// them out or it acknowledges events it never looked at.
pub const HPRT_W1C_MASK: u32 = HPRT_ENA | HPRT_CONNDET | HPRT_ENCHNG | HPRT_OVRCURRCHNG;

// ---------------------------------------------------------------------------
// Host channel registers
// ---------------------------------------------------------------------------

pub const HC_BASE: usize = 0x500;
pub const HC_STRIDE: usize = 0x20;

pub const fn hcchar(n: usize) -> usize {
    HC_BASE + n * HC_STRIDE
}

pub const fn hcsplt(n: usize) -> usize {
    HC_BASE + n * HC_STRIDE + 0x04
}

pub const fn hcint(n: usize) -> usize {
    HC_BASE + n * HC_STRIDE + 0x08
}

pub const fn hcintmsk(n: usize) -> usize {
    HC_BASE + n * HC_STRIDE + 0x0c
}

pub const fn hctsiz(n: usize) -> usize {
    HC_BASE + n * HC_STRIDE + 0x10
}

pub const fn hcdma(n: usize) -> usize {
    HC_BASE + n * HC_STRIDE + 0x14
}

// HCCHAR
pub const HCCHAR_MPS_MASK: u32 = 0x7ff;
pub const HCCHAR_EPNUM_POS: u32 = 11;
pub const HCCHAR_EPNUM_MASK: u32 = 0xf << 11;
pub const HCCHAR_EPDIR: u32 = 1 << 15;
pub const HCCHAR_LSPDDEV: u32 = 1 << 17;
pub const HCCHAR_EPTYPE_POS: u32 = 18;
pub const HCCHAR_EPTYPE_MASK: u32 = 0x3 << 18;
pub const HCCHAR_EC_POS: u32 = 20;
pub const HCCHAR_EC_MASK: u32 = 0x3 << 20;
pub const HCCHAR_DEVADDR_POS: u32 = 22;
pub const HCCHAR_DEVADDR_MASK: u32 = 0x7f << 22;
pub const HCCHAR_ODDFRM: u32 = 1 << 29;
pub const HCCHAR_CHDIS: u32 = 1 << 30;
pub const HCCHAR_CHENA: u32 = 1 << 31;

// HCSPLT
pub const HCSPLT_PRTADDR_MASK: u32 = 0x7f;
pub const HCSPLT_HUBADDR_POS: u32 = 7;
pub const HCSPLT_HUBADDR_MASK: u32 = 0x7f << 7;
pub const HCSPLT_XACTPOS_POS: u32 = 14;
pub const HCSPLT_XACTPOS_MASK: u32 = 0x3 << 14;
pub const HCSPLT_XACTPOS_ALL: u32 = 3;
pub const HCSPLT_COMPSPLT: u32 = 1 << 16;
pub const HCSPLT_SPLTENA: u32 = 1 << 31;

// HCTSIZ
pub const HCTSIZ_XFERSIZE_MASK: u32 = 0x7_ffff;
pub const HCTSIZ_PKTCNT_POS: u32 = 19;
pub const HCTSIZ_PKTCNT_MASK: u32 = 0x3ff << 19;
pub const HCTSIZ_PID_POS: u32 = 29;
pub const HCTSIZ_PID_MASK: u32 = 0x3 << 29;
pub const HCTSIZ_DOPNG: u32 = 1 << 31;

// HCINT / HCINTMSK bits live in `channel::HcInt`
