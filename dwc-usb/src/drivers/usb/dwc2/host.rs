//! DWC2 host controller
//!
//! [`Dwc2Host`] drives one root port and a bank of host channels in buffer
//! DMA mode:
//!
//! - [`Dwc2Host::enqueue`] binds a transfer to a free channel, or queues it
//!   until one is released. Control transfers walk SETUP, DATA and STATUS on
//!   the same channel.
//! - [`Dwc2Host::isr`] acknowledges the core, decodes port changes and runs
//!   every interrupting channel through the decode table. A control stage
//!   that completed without finishing the transfer is continued right there;
//!   everything else is posted to the worker. The ISR never waits for the
//!   worker: if the worker holds the driver state, the ISR masks the core
//!   and leaves the whole interrupt to the worker.
//! - [`Dwc2Host::process_events`] is the worker body. It handles the port
//!   event first (debounce, bus reset, recovery), then every posted channel,
//!   then the frame tick that re-polls periodic channels.
//!
//! Interrupt and isochronous channels are polled once per endpoint interval.
//! A poll that found nothing parks the channel until `HFNUM` reaches the
//! next due frame; SOF interrupts are unmasked only while a channel waits.
//!
//! # Usage
//!
//! ```ignore
//! let uhc = Dwc2Host::new(mmio, clock, stack, Dwc2Config::default());
//! uhc.init()?;
//! uhc.enable()?;
//! // interrupt handler:
//! uhc.isr();
//! // worker thread, woken whenever uhc.pending_events() != 0:
//! uhc.process_events();
//! ```

use alloc::{
    boxed::Box,
    collections::{BTreeMap, VecDeque},
    vec::Vec,
};
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use super::{
    channel::{
        calc_packet_count, encode_hcchar, encode_hcsplt, encode_hctsiz, frame_after,
        frame_reached, next_pid, oddfrm_for, poll_period, ChanEvents, ChannelKind, ControlState,
        HcInt, Pid, RetryState,
    },
    decode::{decode, DecodeCtx},
    fifo::FifoConfig,
    port::{decode_port_intr, port_speed, HwPortEvent, PortEvent, PortFlags, PortState},
    regs::*,
};
use crate::{
    config::Dwc2Config,
    drivers::usb::{
        buf::UsbBuf,
        ch9::{ep_addr, EndpointType, SetupPacket, UsbDirection, UsbSpeed},
        control::ControlStage,
    },
    error::{UsbError, UsbResult},
    mmio::{field_get, RegisterBlock},
    sync::EventFlags,
    timer::{poll_until, Clock},
};

/// Worker event bit of the root port
const PORT_EVENT: u32 = 1 << 0;

/// Worker event bit of channel `n`
const fn chan_event_bit(n: usize) -> u32 {
    1 << (n + 1)
}

/// Worker event bit of the SOF tick
const FRAME_EVENT: u32 = 1 << 30;

/// The ISR found the state busy and left the interrupt to the worker
const DEFERRED_IRQ: u32 = 1 << 31;

/// Events reported to the host stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UhcEvent {
    DevConnectedLs,
    DevConnectedFs,
    DevConnectedHs,
    DevRemoved,
    Reseted,
    /// The root port could not be recovered
    Error,
}

/// One transfer requested by the host stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UhcTransfer {
    /// Endpoint address, direction bit included
    pub ep: u8,
    pub dev_addr: u8,
    pub mps: u16,
    pub ep_type: EndpointType,
    /// `bInterval` of a periodic endpoint
    pub interval: u8,
    /// SETUP packet of a control transfer
    pub setup: Option<SetupPacket>,
    pub buf: Option<UsbBuf>,
    /// Device speed, the root port speed when `None`
    pub speed: Option<UsbSpeed>,
    /// High-speed hub address and port for split transactions
    pub hub: Option<(u8, u8)>,
}

impl UhcTransfer {
    /// Control transfer on endpoint 0. `buf` is the data stage buffer.
    pub fn control(dev_addr: u8, mps: u16, setup: SetupPacket, buf: Option<UsbBuf>) -> Self {
        Self {
            ep: ep_addr::EP0_OUT,
            dev_addr,
            mps,
            ep_type: EndpointType::Control,
            interval: 0,
            setup: Some(setup),
            buf,
            speed: None,
            hub: None,
        }
    }

    /// Bulk, interrupt or isochronous transfer of `buf`
    pub fn new(ep: u8, ep_type: EndpointType, dev_addr: u8, mps: u16, buf: UsbBuf) -> Self {
        Self {
            ep,
            dev_addr,
            mps,
            ep_type,
            interval: 0,
            setup: None,
            buf: Some(buf),
            speed: None,
            hub: None,
        }
    }

    pub fn with_interval(mut self, interval: u8) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_speed(mut self, speed: UsbSpeed) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn via_hub(mut self, hub_addr: u8, port: u8) -> Self {
        self.hub = Some((hub_addr, port));
        self
    }

    fn targets(&self, dev_addr: u8, ep: u8) -> bool {
        self.dev_addr == dev_addr
            && ep_addr::index(self.ep) == ep_addr::index(ep)
            && (self.ep_type == EndpointType::Control || self.ep == ep)
    }
}

/// The host stack above the controller driver
pub trait UhcStack: Send + Sync {
    fn submit_event(&self, event: UhcEvent);

    /// Transfer finished; `Err(Aborted)` when dequeued or the device left
    fn xfer_return(&self, xfer: UhcTransfer, result: UsbResult<()>);
}

/// Capabilities read from the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwConfig {
    pub snpsid: u32,
    pub numchannels: u32,
    /// FIFO RAM in 32-bit words
    pub fifodepth: u32,
    pub hsphytype: u32,
    pub fsphytype: u32,
    pub phydatawidth: u32,
    pub bufferdma: bool,
}

enum Notification {
    Event(UhcEvent),
    XferDone(UhcTransfer, UsbResult<()>),
}

/// One stage as programmed into HCTSIZ/HCDMA
#[derive(Debug, Clone, Copy)]
struct StagePlan {
    dir: UsbDirection,
    pid: Pid,
    size: u32,
    pktcnt: u32,
    dma: u64,
}

struct ChannelState {
    xfer: UhcTransfer,
    kind: ChannelKind,
    ctrl: Option<ControlState>,
    ctx: DecodeCtx,
    stage: StagePlan,
    /// DMA copy of the SETUP packet, also the target of zero-length stages
    setup_dma: Box<[u8; 8]>,
    /// Polling period in `HFNUM` ticks, periodic endpoints only
    period: Option<u16>,
    /// Frame at which a parked periodic channel polls again
    due: Option<u16>,
}

impl ChannelState {
    fn transfer_done(&self) -> bool {
        self.ctrl.map_or(true, |ctrl| ctrl.is_done())
    }

    fn plan(&self, stage: ControlStage) -> StagePlan {
        let mps = self.xfer.mps;
        let setup_dma = self.setup_dma.as_ptr() as u64;
        match stage {
            ControlStage::Setup => StagePlan {
                dir: UsbDirection::Out,
                pid: Pid::Setup,
                size: SetupPacket::SIZE as u32,
                pktcnt: 1,
                dma: setup_dma,
            },
            ControlStage::Data(dir) => {
                let w_length = self.ctrl.map_or(0, |ctrl| ctrl.setup().w_length as u32);
                let (dma, size) = buf_window(self.xfer.buf.as_ref(), dir);
                let size = size.min(w_length);
                StagePlan {
                    dir,
                    pid: Pid::Data1,
                    size,
                    pktcnt: calc_packet_count(size, mps),
                    dma,
                }
            }
            ControlStage::Status(dir) => StagePlan {
                dir,
                pid: Pid::Data1,
                size: 0,
                pktcnt: 1,
                dma: setup_dma,
            },
        }
    }
}

/// DMA address and size of `buf` for a stage in `dir`. IN stages receive
/// into the free tail, OUT stages send the used part.
fn buf_window(buf: Option<&UsbBuf>, dir: UsbDirection) -> (u64, u32) {
    match buf {
        Some(buf) if dir.is_in() => (buf.tail_dma_addr(), buf.tailroom() as u32),
        Some(buf) => (buf.dma_addr(), buf.len() as u32),
        None => (0, 0),
    }
}

struct HostState {
    hw: Option<HwConfig>,
    fifo: Option<FifoConfig>,
    port: PortState,
    flags: PortFlags,
    last_event: Option<PortEvent>,
    /// DevConnected was reported and DevRemoved not yet
    has_device: bool,
    /// Last address assigned with SET_ADDRESS
    dev_addr: u8,
    channels: Vec<Option<ChannelState>>,
    pending: VecDeque<UhcTransfer>,
    /// Next data toggle per (device, endpoint)
    toggles: BTreeMap<(u8, u8), Pid>,
    initialized: bool,
}

/// Synopsys DWC2 USB host controller
pub struct Dwc2Host<R, C, S>
where
    R: RegisterBlock,
    C: Clock,
    S: UhcStack,
{
    regs: R,
    clock: C,
    stack: S,
    config: Dwc2Config,
    state: Mutex<HostState>,
    events: EventFlags,
    /// Per-channel [`ChanEvents`], posted by the ISR and drained by the worker
    chan_events: Vec<AtomicU32>,
}

impl<R, C, S> Dwc2Host<R, C, S>
where
    R: RegisterBlock,
    C: Clock,
    S: UhcStack,
{
    pub fn new(regs: R, clock: C, stack: S, config: Dwc2Config) -> Self {
        Self {
            regs,
            clock,
            stack,
            state: Mutex::new(HostState {
                hw: None,
                fifo: None,
                port: PortState::NotPowered,
                flags: PortFlags::default(),
                last_event: None,
                has_device: false,
                dev_addr: 0,
                channels: Vec::new(),
                pending: VecDeque::new(),
                toggles: BTreeMap::new(),
                initialized: false,
            }),
            events: EventFlags::new(),
            chan_events: (0..config.max_channels).map(|_| AtomicU32::new(0)).collect(),
            config,
        }
    }

    pub fn config(&self) -> &Dwc2Config {
        &self.config
    }

    pub fn port_state(&self) -> PortState {
        self.state.lock().port
    }

    pub fn hw_config(&self) -> Option<HwConfig> {
        self.state.lock().hw
    }

    /// Channels in use, the smaller of the configured and implemented count
    pub fn num_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Address assigned by the last completed SET_ADDRESS
    pub fn device_address(&self) -> u8 {
        self.state.lock().dev_addr
    }

    /// Worker event bits not yet processed
    pub fn pending_events(&self) -> u32 {
        self.events.pending()
    }

    // -----------------------------------------------------------------------
    // Core bring-up
    // -----------------------------------------------------------------------

    fn read_hw_config(&self) -> UsbResult<HwConfig> {
        let snpsid = self.regs.read32(GSNPSID);
        if snpsid == 0 {
            log::error!("[DWC2] Core not powered or not present");
            return Err(UsbError::NoDevice);
        }

        let ghwcfg2 = self.regs.read32(GHWCFG2);
        let ghwcfg3 = self.regs.read32(GHWCFG3);
        let ghwcfg4 = self.regs.read32(GHWCFG4);
        if ghwcfg4 & GHWCFG4_DEDFIFOMODE == 0 {
            log::error!("[DWC2] Only dedicated TX FIFO mode is supported");
            return Err(UsbError::NotSupported {
                operation: "shared FIFO mode",
            });
        }

        let otgarch = field_get(ghwcfg2, GHWCFG2_OTGARCH_MASK, GHWCFG2_OTGARCH_POS);
        let hw = HwConfig {
            snpsid,
            numchannels: field_get(ghwcfg2, GHWCFG2_NUMHSTCHNL_MASK, GHWCFG2_NUMHSTCHNL_POS) + 1,
            fifodepth: field_get(ghwcfg3, GHWCFG3_DFIFODEPTH_MASK, GHWCFG3_DFIFODEPTH_POS),
            hsphytype: field_get(ghwcfg2, GHWCFG2_HSPHYTYPE_MASK, GHWCFG2_HSPHYTYPE_POS),
            fsphytype: field_get(ghwcfg2, GHWCFG2_FSPHYTYPE_MASK, GHWCFG2_FSPHYTYPE_POS),
            phydatawidth: field_get(ghwcfg4, GHWCFG4_PHYDATAWIDTH_MASK, GHWCFG4_PHYDATAWIDTH_POS),
            bufferdma: self.config.dma && otgarch == GHWCFG2_OTGARCH_INTERNALDMA,
        };
        if !hw.bufferdma {
            log::error!("[DWC2] Buffer DMA unavailable (OTGARCH {})", otgarch);
            return Err(UsbError::NotSupported {
                operation: "host without buffer DMA",
            });
        }
        Ok(hw)
    }

    fn core_reset(&self) -> UsbResult<()> {
        let timeout = self.config.core_reset_timeout_us;
        poll_until(&self.clock, timeout, "AHB idle", || {
            self.regs.read32(GRSTCTL) & GRSTCTL_AHBIDLE != 0
        })?;

        self.regs.set_bits(GRSTCTL, GRSTCTL_CSFTRST);
        // Newer cores report completion in CSFTRSTDONE, older ones clear CSFTRST
        poll_until(&self.clock, timeout, "core soft reset", || {
            let grstctl = self.regs.read32(GRSTCTL);
            grstctl & GRSTCTL_CSFTRST == 0 || grstctl & GRSTCTL_CSFTRSTDONE != 0
        })?;

        let grstctl = self.regs.read32(GRSTCTL);
        self.regs
            .write32(GRSTCTL, (grstctl & !GRSTCTL_CSFTRST) | GRSTCTL_CSFTRSTDONE);
        Ok(())
    }

    fn select_phy(&self, hw: &HwConfig) -> UsbResult<()> {
        let mut gusbcfg = self.regs.read32(GUSBCFG);
        if hw.hsphytype != 0 {
            gusbcfg &= !GUSBCFG_PHYSEL_USB11;
            if hw.hsphytype == GHWCFG2_HSPHYTYPE_ULPI {
                gusbcfg |= GUSBCFG_ULPI_UTMI_SEL;
                gusbcfg &= !GUSBCFG_PHYIF16;
            } else {
                gusbcfg &= !GUSBCFG_ULPI_UTMI_SEL;
                if hw.phydatawidth != 0 {
                    gusbcfg |= GUSBCFG_PHYIF16;
                } else {
                    gusbcfg &= !GUSBCFG_PHYIF16;
                }
            }
        } else {
            gusbcfg |= GUSBCFG_PHYSEL_USB11;
        }
        self.regs.write32(GUSBCFG, gusbcfg);
        self.core_reset()
    }

    fn set_defaults(&self, st: &mut HostState, hw: &HwConfig) -> UsbResult<()> {
        self.regs.clear_bits(GAHBCFG, GAHBCFG_GLBINTRMASK);

        self.regs.set_bits(GUSBCFG, GUSBCFG_FORCEHSTMODE);
        poll_until(
            &self.clock,
            self.config.core_reset_timeout_us,
            "host mode",
            || self.regs.read32(GINTSTS) & GINTSTS_CURMOD != 0,
        )?;

        self.regs.write32(GINTMSK, 0);
        self.regs.set_bits(GINTMSK, GINTSTS_DISCONNINT);
        let gintsts = self.regs.read32(GINTSTS);
        self.regs.write32(GINTSTS, gintsts);

        let mut gahbcfg = self.regs.read32(GAHBCFG) | GAHBCFG_NPTXFEMPLVL;
        gahbcfg &= !GAHBCFG_HBSTLEN_MASK;
        gahbcfg |= GAHBCFG_HBSTLEN_INCR16 << GAHBCFG_HBSTLEN_POS;
        if hw.bufferdma {
            gahbcfg |= GAHBCFG_DMAEN;
        }
        self.regs.write32(GAHBCFG, gahbcfg);
        self.regs.set_bits(GAHBCFG, GAHBCFG_GLBINTRMASK);

        st.port = PortState::NotPowered;
        st.flags = PortFlags::default();
        st.last_event = None;
        Ok(())
    }

    /// Read the core configuration, size the FIFOs and bring the core up in
    /// host mode with the port unpowered.
    fn init_controller(&self, st: &mut HostState) -> UsbResult<()> {
        let hw = self.read_hw_config()?;
        let fifo = FifoConfig::compute(hw.fifodepth, hw.numchannels)?;
        self.select_phy(&hw)?;
        self.set_defaults(st, &hw)?;

        let count = (hw.numchannels as usize).min(self.config.max_channels);
        st.channels = (0..count).map(|_| None).collect();
        st.hw = Some(hw);
        st.fifo = Some(fifo);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Controller lifecycle
    // -----------------------------------------------------------------------

    pub fn init(&self) -> UsbResult<()> {
        self.config.validate()?;
        let mut st = self.state.lock();
        self.init_controller(&mut st)?;
        st.initialized = true;
        if let Some(hw) = st.hw {
            log::info!(
                "[DWC2] Core 0x{:08x}: {} channels, FIFO {} words",
                hw.snpsid,
                st.channels.len(),
                hw.fifodepth
            );
        }
        Ok(())
    }

    /// Power the root port.
    pub fn enable(&self) -> UsbResult<()> {
        let mut st = self.state.lock();
        if !st.initialized {
            return Err(UsbError::InvalidState {
                expected: "initialized",
                actual: "uninitialized",
            });
        }
        if st.port != PortState::NotPowered {
            return Ok(());
        }
        self.power_on(&mut st);
        log::info!("[DWC2] Root port powered");
        Ok(())
    }

    /// Power the port down, aborting every transfer.
    pub fn disable(&self) -> UsbResult<()> {
        let mut notes = Vec::new();
        {
            let mut st = self.state.lock();
            if !st.initialized {
                return Err(UsbError::InvalidState {
                    expected: "initialized",
                    actual: "uninitialized",
                });
            }
            self.abort_all(&mut st, &mut notes);
            if st.has_device {
                st.has_device = false;
                notes.push(Notification::Event(UhcEvent::DevRemoved));
            }
            let hprt = self.regs.read32(HPRT) & !HPRT_W1C_MASK;
            self.regs.write32(HPRT, hprt & !HPRT_PWR);
            self.regs.clear_bits(GAHBCFG, GAHBCFG_GLBINTRMASK);
            st.port = PortState::NotPowered;
            st.flags = PortFlags::default();
            st.last_event = None;
        }
        self.deliver(notes);
        log::info!("[DWC2] Root port powered down");
        Ok(())
    }

    pub fn shutdown(&self) -> UsbResult<()> {
        if !self.state.lock().initialized {
            return Ok(());
        }
        self.disable()?;

        let mut st = self.state.lock();
        self.regs.write32(GINTMSK, 0);
        self.regs.write32(HAINTMSK, 0);
        st.channels.clear();
        st.toggles.clear();
        st.hw = None;
        st.fifo = None;
        st.initialized = false;
        self.events.take_all();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Bus API
    // -----------------------------------------------------------------------

    /// The port is reset when a device connects, so this only reports it.
    pub fn bus_reset(&self) -> UsbResult<()> {
        self.stack.submit_event(UhcEvent::Reseted);
        Ok(())
    }

    pub fn sof_enable(&self) -> UsbResult<()> {
        log::error!("[DWC2] SOF enable is not supported");
        Err(UsbError::NotSupported {
            operation: "sof_enable",
        })
    }

    pub fn bus_suspend(&self) -> UsbResult<()> {
        log::error!("[DWC2] Bus suspend is not supported");
        Err(UsbError::NotSupported {
            operation: "bus_suspend",
        })
    }

    pub fn bus_resume(&self) -> UsbResult<()> {
        log::error!("[DWC2] Bus resume is not supported");
        Err(UsbError::NotSupported {
            operation: "bus_resume",
        })
    }

    // -----------------------------------------------------------------------
    // Transfer API
    // -----------------------------------------------------------------------

    /// Start `xfer` on a free channel, or queue it until one frees up.
    pub fn enqueue(&self, xfer: UhcTransfer) -> UsbResult<()> {
        if xfer.mps == 0 {
            return Err(UsbError::InvalidArgument {
                name: "mps",
                value: "zero",
            });
        }
        match (xfer.ep_type, &xfer.setup) {
            (EndpointType::Control, None) => {
                return Err(UsbError::InvalidArgument {
                    name: "setup",
                    value: "control transfer without SETUP packet",
                });
            }
            (EndpointType::Control, Some(setup)) if setup.has_data_stage() && xfer.buf.is_none() => {
                return Err(UsbError::InvalidArgument {
                    name: "buf",
                    value: "data stage without buffer",
                });
            }
            (EndpointType::Control, _) => {}
            (_, _) if xfer.buf.is_none() => {
                return Err(UsbError::InvalidArgument {
                    name: "buf",
                    value: "missing",
                });
            }
            _ => {}
        }

        let mut st = self.state.lock();
        if st.port != PortState::Enabled {
            log::error!("[DWC2] Port {}, cannot enqueue", st.port.as_str());
            return Err(UsbError::NoDevice);
        }

        match st.channels.iter().position(Option::is_none) {
            Some(n) => self.bind(&mut st, n, xfer),
            None => {
                log::debug!("[DWC2] All channels busy, ep 0x{:02x} queued", xfer.ep);
                st.pending.push_back(xfer);
            }
        }
        Ok(())
    }

    /// Cancel every transfer to endpoint `ep` of device `dev_addr`.
    ///
    /// Queued transfers are returned at once. A channel that is still
    /// running is halted and its transfer returned when the halt lands.
    pub fn dequeue(&self, dev_addr: u8, ep: u8) -> UsbResult<()> {
        let mut notes = Vec::new();
        let mut found = false;
        {
            let mut st = self.state.lock();

            let mut kept = VecDeque::with_capacity(st.pending.len());
            while let Some(xfer) = st.pending.pop_front() {
                if xfer.targets(dev_addr, ep) {
                    found = true;
                    notes.push(Notification::XferDone(xfer, Err(UsbError::Aborted)));
                } else {
                    kept.push_back(xfer);
                }
            }
            st.pending = kept;

            for n in 0..st.channels.len() {
                let Some(ch) = st.channels[n].as_mut() else {
                    continue;
                };
                if !ch.xfer.targets(dev_addr, ep) {
                    continue;
                }
                found = true;
                if self.regs.read32(hcchar(n)) & HCCHAR_CHENA != 0 {
                    ch.ctx.halt_requested = true;
                    self.regs.set_bits(hcchar(n), HCCHAR_CHENA | HCCHAR_CHDIS);
                    log::debug!("[DWC2] Halting channel {}", n);
                } else {
                    self.release(&mut st, n, Err(UsbError::Aborted), &mut notes);
                }
            }
        }
        self.deliver(notes);

        if found {
            Ok(())
        } else {
            Err(UsbError::InvalidArgument {
                name: "xfer",
                value: "not queued",
            })
        }
    }

    // -----------------------------------------------------------------------
    // Channel programming
    // -----------------------------------------------------------------------

    fn bind(&self, st: &mut HostState, n: usize, xfer: UhcTransfer) {
        let ctrl = xfer.setup.map(ControlState::begin);
        let first_dir = if ctrl.is_some() {
            UsbDirection::Out
        } else {
            ep_addr::direction(xfer.ep)
        };
        let kind = ChannelKind::new(first_dir, xfer.hub.is_some(), xfer.ep_type);
        let root_speed = port_speed(self.regs.read32(HPRT));
        let speed = xfer.speed.or(root_speed);
        let period = matches!(xfer.ep_type, EndpointType::Interrupt | EndpointType::Isochronous)
            .then(|| {
                poll_period(
                    xfer.ep_type,
                    xfer.interval,
                    speed == Some(UsbSpeed::High),
                    root_speed == Some(UsbSpeed::High),
                )
            });
        let setup_bytes = xfer.setup.map_or([0; 8], |setup| setup.to_bytes());

        let stage = if ctrl.is_some() {
            StagePlan {
                dir: UsbDirection::Out,
                pid: Pid::Setup,
                size: SetupPacket::SIZE as u32,
                pktcnt: 1,
                dma: 0,
            }
        } else {
            let pid = st
                .toggles
                .get(&(xfer.dev_addr, xfer.ep))
                .copied()
                .unwrap_or(Pid::Data0);
            let (dma, size) = buf_window(xfer.buf.as_ref(), first_dir);
            StagePlan {
                dir: first_dir,
                pid,
                size,
                pktcnt: calc_packet_count(size, xfer.mps),
                dma,
            }
        };

        let mut ch = ChannelState {
            kind,
            ctrl,
            ctx: DecodeCtx::new(kind),
            stage,
            setup_dma: Box::new(setup_bytes),
            period,
            due: None,
            xfer,
        };
        if ch.ctrl.is_some() {
            ch.stage = ch.plan(ControlStage::Setup);
        }

        let hcint_raw = self.regs.read32(hcint(n));
        self.regs.write32(hcint(n), hcint_raw);
        self.regs.set_bits(HAINTMSK, 1 << n);
        self.regs
            .write32(hcintmsk(n), (HcInt::XFERCOMPL | HcInt::CHHLTD).bits());
        self.regs.write32(
            hcchar(n),
            encode_hcchar(
                ch.xfer.ep,
                ch.xfer.dev_addr,
                ch.xfer.mps,
                ch.xfer.ep_type,
                first_dir,
                speed == Some(UsbSpeed::Low),
            ),
        );
        let hcsplt_val = ch
            .xfer
            .hub
            .map_or(0, |(hub_addr, port)| encode_hcsplt(hub_addr, port));
        self.regs.write32(hcsplt(n), hcsplt_val);

        log::debug!(
            "[DWC2] ch{} <- dev {} ep 0x{:02x} {:?} period {:?}",
            n,
            ch.xfer.dev_addr,
            ch.xfer.ep,
            ch.xfer.ep_type,
            ch.period
        );
        self.program_stage(n, &ch);
        st.channels[n] = Some(ch);
    }

    /// Program the channel's current stage from scratch and enable it.
    fn program_stage(&self, n: usize, ch: &ChannelState) {
        self.load_stage(n, ch);
        self.enable_channel(n, ch);
    }

    fn load_stage(&self, n: usize, ch: &ChannelState) {
        let plan = ch.stage;
        if plan.dir.is_in() {
            self.regs.set_bits(hcchar(n), HCCHAR_EPDIR);
        } else {
            self.regs.clear_bits(hcchar(n), HCCHAR_EPDIR);
        }
        self.regs
            .write32(hctsiz(n), encode_hctsiz(plan.size, plan.pktcnt, plan.pid));
        self.regs.write32(hcdma(n), plan.dma as u32);
        if ch.kind.split {
            self.regs.clear_bits(hcsplt(n), HCSPLT_COMPSPLT);
        }
    }

    /// Enable the channel with HCTSIZ/HCDMA as the core left them. A
    /// periodic channel is aimed at the next frame.
    fn enable_channel(&self, n: usize, ch: &ChannelState) {
        let hcint_raw = self.regs.read32(hcint(n));
        self.regs.write32(hcint(n), hcint_raw);
        let mut hcchar_val = (self.regs.read32(hcchar(n)) | HCCHAR_CHENA) & !HCCHAR_CHDIS;
        if ch.period.is_some() {
            hcchar_val = (hcchar_val & !HCCHAR_ODDFRM) | oddfrm_for(self.frame_number());
        }
        self.regs.write32(hcchar(n), hcchar_val);
    }

    fn frame_number(&self) -> u16 {
        (self.regs.read32(HFNUM) & HFNUM_FRNUM_MASK) as u16 & HFNUM_MAX_FRNUM
    }

    /// Leave the channel disabled until its next polling interval.
    fn park(&self, n: usize, ch: &mut ChannelState, period: u16) {
        let due = frame_after(self.frame_number(), period);
        ch.due = Some(due);
        self.regs.set_bits(GINTMSK, GINTSTS_SOF);
        log::trace!("[DWC2] ch{} parked until frame {}", n, due);
    }

    /// Bytes the core wrote for the IN stage just finished
    fn received(&self, n: usize, plan: &StagePlan) -> usize {
        let remaining = self.regs.read32(hctsiz(n)) & HCTSIZ_XFERSIZE_MASK;
        plan.size.saturating_sub(remaining) as usize
    }

    fn account_in_stage(&self, n: usize, ch: &mut ChannelState) {
        if !ch.stage.dir.is_in() || ch.stage.size == 0 {
            return;
        }
        let received = self.received(n, &ch.stage);
        if let Some(buf) = ch.xfer.buf.as_mut() {
            buf.add(received);
        }
    }

    /// Program the control stage after the one that just completed.
    fn continue_transfer(&self, n: usize, ch: &mut ChannelState) {
        self.account_in_stage(n, ch);
        let Some(ctrl) = ch.ctrl.as_mut() else {
            return;
        };
        let Some(stage) = ctrl.continue_stage() else {
            return;
        };
        ch.stage = ch.plan(stage);
        ch.kind.direction = stage.direction();
        ch.ctx.retry = RetryState::new(ch.kind);
        self.program_stage(n, ch);
    }

    /// Act on a retry outcome of the decode table.
    fn rearm(&self, n: usize, ch: &mut ChannelState, events: ChanEvents) {
        if events.contains(ChanEvents::DO_RETRY_SSPLIT) {
            self.program_stage(n, ch);
        } else if events.contains(ChanEvents::DO_NEXT_SSPLIT) {
            self.regs.clear_bits(hcsplt(n), HCSPLT_COMPSPLT);
            self.enable_channel(n, ch);
        } else if events.intersects(
            ChanEvents::DO_RETRY_CSPLIT | ChanEvents::DO_NEXT_CSPLIT | ChanEvents::DO_REENABLE_CHANNEL,
        ) {
            self.regs.set_bits(hcsplt(n), HCSPLT_COMPSPLT);
            self.enable_channel(n, ch);
        } else if let (Some(period), true) = (
            ch.period,
            events.intersects(ChanEvents::DO_REWIND_BUFFER | ChanEvents::DO_REINIT),
        ) {
            // A split poll starts over with a start-split
            if events.contains(ChanEvents::DO_REWIND_BUFFER) || ch.kind.split {
                self.load_stage(n, ch);
            }
            self.park(n, ch, period);
        } else if events.contains(ChanEvents::DO_REWIND_BUFFER) {
            self.program_stage(n, ch);
        } else if events.contains(ChanEvents::DO_REINIT) {
            self.enable_channel(n, ch);
        }
    }

    /// Free channel `n` and return its transfer. Binds the next queued
    /// transfer, if any. Returns the address a completed SET_ADDRESS
    /// assigned.
    fn release(
        &self,
        st: &mut HostState,
        n: usize,
        result: UsbResult<()>,
        notes: &mut Vec<Notification>,
    ) -> Option<u8> {
        let mut ch = st.channels.get_mut(n)?.take()?;
        self.regs.clear_bits(HAINTMSK, 1 << n);
        self.regs.write32(hcintmsk(n), 0);

        let mut new_addr = None;
        if result.is_ok() {
            match ch.ctrl {
                Some(ctrl) => {
                    if let Some(addr) = ctrl.set_addr() {
                        st.dev_addr = addr;
                        st.toggles.retain(|&(dev, _), _| dev != addr);
                        new_addr = Some(addr);
                    }
                }
                None => {
                    self.account_in_stage(n, &mut ch);
                    let left = field_get(
                        self.regs.read32(hctsiz(n)),
                        HCTSIZ_PKTCNT_MASK,
                        HCTSIZ_PKTCNT_POS,
                    );
                    let sent = ch.stage.pktcnt.saturating_sub(left);
                    st.toggles.insert(
                        (ch.xfer.dev_addr, ch.xfer.ep),
                        next_pid(ch.stage.pid, sent),
                    );
                }
            }
        }

        log::debug!("[DWC2] ch{} released: {:?}", n, result);
        notes.push(Notification::XferDone(ch.xfer, result));

        if st.port == PortState::Enabled {
            if let Some(next) = st.pending.pop_front() {
                self.bind(st, n, next);
            }
        }
        new_addr
    }

    /// Halt every channel and return every transfer with `Aborted`.
    fn abort_all(&self, st: &mut HostState, notes: &mut Vec<Notification>) {
        while let Some(xfer) = st.pending.pop_front() {
            notes.push(Notification::XferDone(xfer, Err(UsbError::Aborted)));
        }
        for n in 0..st.channels.len() {
            if st.channels[n].is_none() {
                continue;
            }
            if self.regs.read32(hcchar(n)) & HCCHAR_CHENA != 0 {
                self.regs.set_bits(hcchar(n), HCCHAR_CHDIS);
            }
            self.chan_events[n].store(0, Ordering::Release);
            self.release(st, n, Err(UsbError::Aborted), notes);
        }
    }

    // -----------------------------------------------------------------------
    // Root port
    // -----------------------------------------------------------------------

    fn power_on(&self, st: &mut HostState) {
        st.port = PortState::Disconnected;
        self.regs.write32(HAINTMSK, 0);
        self.regs
            .set_bits(GINTMSK, GINTSTS_PRTINT | GINTSTS_HCHINT);
        let hprt = self.regs.read32(HPRT) & !HPRT_W1C_MASK;
        self.regs.write32(HPRT, hprt | HPRT_PWR);
    }

    fn toggle_reset(&self, assert: bool) {
        let hprt = self.regs.read32(HPRT) & !HPRT_W1C_MASK;
        let hprt = if assert {
            hprt | HPRT_RST
        } else {
            hprt & !HPRT_RST
        };
        self.regs.write32(HPRT, hprt);
    }

    /// Program frame timing once the port reports enabled.
    fn port_enable(&self, st: &HostState) {
        let hcfg = self.regs.read32(HCFG) & !(HCFG_DESCDMA | HCFG_PERSCHEDENA);
        let fs_phy = st.hw.map_or(true, |hw| hw.hsphytype == 0);
        if !fs_phy {
            self.regs.write32(HCFG, hcfg);
            log::debug!("[DWC2] HS PHY keeps its reset frame timing");
            return;
        }

        let low_speed = port_speed(self.regs.read32(HPRT)) == Some(UsbSpeed::Low);
        let (clksel, frint) = if low_speed {
            (HCFG_FSLSPCLKSEL_6, HFIR_FRINT_LS_6)
        } else {
            (HCFG_FSLSPCLKSEL_48, HFIR_FRINT_FS_48)
        };
        self.regs
            .write32(HCFG, (hcfg & !HCFG_FSLSPCLKSEL_MASK) | clksel);
        let hfir = self.regs.read32(HFIR) & !(HFIR_RLDCTRL | HFIR_FRINT_MASK);
        self.regs.write32(HFIR, hfir | frint);
    }

    /// Mask connect/disconnect interrupts until the connection is debounced.
    fn lock_enable(&self, st: &mut HostState) {
        st.flags.lock_enabled = true;
        self.regs
            .clear_bits(GINTMSK, GINTSTS_PRTINT | GINTSTS_DISCONNINT);
    }

    fn lock_disable(&self, st: &mut HostState) {
        st.flags.lock_enabled = false;
        self.regs.write32(GINTSTS, GINTSTS_DISCONNINT);
        let hprt = self.regs.read32(HPRT) & !HPRT_W1C_MASK;
        self.regs.write32(HPRT, hprt | HPRT_CONNDET);
        self.regs
            .set_bits(GINTMSK, GINTSTS_PRTINT | GINTSTS_DISCONNINT);
    }

    /// Apply a hardware port event and map it to the worker's event.
    fn port_hw_event(&self, st: &mut HostState, hw: HwPortEvent) -> Option<PortEvent> {
        match hw {
            HwPortEvent::Conn => Some(PortEvent::Connection),
            HwPortEvent::Disconn => {
                st.flags.conn_dev_ena = false;
                Some(PortEvent::Disconnection)
            }
            HwPortEvent::Enabled => {
                self.port_enable(st);
                st.flags.conn_dev_ena = true;
                Some(PortEvent::Enabled)
            }
            HwPortEvent::Disabled => {
                st.flags.conn_dev_ena = false;
                if st.port == PortState::Resetting {
                    None
                } else if st.flags.waiting_disable {
                    st.flags.waiting_disable = false;
                    st.port = PortState::Disabled;
                    None
                } else {
                    st.port = PortState::Recovery;
                    Some(PortEvent::Error)
                }
            }
            HwPortEvent::Overcurrent => {
                st.flags.conn_dev_ena = false;
                st.port = PortState::Recovery;
                Some(PortEvent::Overcurrent)
            }
            HwPortEvent::OvercurrentCleared => None,
        }
    }

    /// Wait out contact bounce, then settle on connected or not.
    fn debounce(&self) -> bool {
        self.clock.sleep_ms(self.config.debounce_delay_ms);

        let mut st = self.state.lock();
        let connected = self.regs.read32(HPRT) & HPRT_CONNSTS != 0;
        st.port = if connected {
            PortState::Disabled
        } else {
            PortState::Disconnected
        };
        self.lock_disable(&mut st);
        connected
    }

    /// Drive reset on the bus, then let it recover. The port must come out
    /// enabled.
    fn port_reset(&self) -> UsbResult<()> {
        {
            let mut st = self.state.lock();
            if !matches!(st.port, PortState::Disabled | PortState::Enabled) {
                return Err(UsbError::InvalidState {
                    expected: "disabled or enabled",
                    actual: st.port.as_str(),
                });
            }
            st.port = PortState::Resetting;
            self.toggle_reset(true);
        }

        self.clock.sleep_ms(self.config.reset_hold_ms);

        {
            let st = self.state.lock();
            if st.port != PortState::Resetting {
                log::error!("[DWC2] Port state changed during reset");
                return Err(UsbError::Io {
                    operation: "port reset",
                });
            }
            self.toggle_reset(false);
        }

        self.clock.sleep_ms(self.config.reset_recovery_ms);

        let st = self.state.lock();
        let enabled = st.flags.conn_dev_ena || self.regs.read32(HPRT) & HPRT_ENA != 0;
        if st.port != PortState::Resetting || !enabled {
            log::error!("[DWC2] Port not enabled after reset");
            return Err(UsbError::Io {
                operation: "port reset",
            });
        }
        if let Some(fifo) = st.fifo {
            fifo.apply(&self.regs, &self.clock, self.config.core_reset_timeout_us)?;
        }
        Ok(())
    }

    /// Start over as if the device had been unplugged: re-initialize the
    /// core with interrupts off and power the port again.
    fn port_recovery(&self) -> UsbResult<()> {
        let mut st = self.state.lock();
        self.regs.clear_bits(GAHBCFG, GAHBCFG_GLBINTRMASK);
        self.init_controller(&mut st)?;
        self.power_on(&mut st);
        log::info!("[DWC2] Root port recovered");
        Ok(())
    }

    fn handle_port_event(&self) {
        let Some(event) = self.state.lock().last_event.take() else {
            return;
        };
        log::debug!("[DWC2] Port event {:?}", event);

        match event {
            PortEvent::Connection => {
                if !self.debounce() {
                    log::warn!("[DWC2] Port not connected after debounce");
                    return;
                }
                if let Err(e) = self.port_reset() {
                    log::error!("[DWC2] Port reset failed: {}", e);
                }
            }
            PortEvent::Enabled => {
                let connected = {
                    let mut st = self.state.lock();
                    st.port = PortState::Enabled;
                    let speed = port_speed(self.regs.read32(HPRT));
                    let event = match speed {
                        Some(UsbSpeed::Low) => Some(UhcEvent::DevConnectedLs),
                        Some(UsbSpeed::Full) => Some(UhcEvent::DevConnectedFs),
                        Some(UsbSpeed::High) => Some(UhcEvent::DevConnectedHs),
                        _ => None,
                    };
                    st.has_device |= event.is_some();
                    event
                };
                match connected {
                    Some(event) => {
                        log::info!("[DWC2] Device connected: {:?}", event);
                        self.stack.submit_event(event);
                    }
                    None => log::error!("[DWC2] Unsupported port speed"),
                }
            }
            PortEvent::Disconnection | PortEvent::Error | PortEvent::Overcurrent => {
                let mut notes = Vec::new();
                {
                    let mut st = self.state.lock();
                    self.abort_all(&mut st, &mut notes);
                    if st.has_device {
                        st.has_device = false;
                        notes.push(Notification::Event(UhcEvent::DevRemoved));
                    }
                    st.port = PortState::Recovery;
                }
                self.deliver(notes);

                if let Err(e) = self.port_recovery() {
                    log::error!("[DWC2] Port recovery failed: {}", e);
                    self.stack.submit_event(UhcEvent::Error);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Interrupt and worker
    // -----------------------------------------------------------------------

    /// Core interrupt handler.
    ///
    /// Never spins on the driver state: when the worker (or another CPU)
    /// holds it, the core's interrupt output is masked and the interrupt is
    /// serviced by the next [`process_events`](Self::process_events).
    pub fn isr(&self) {
        match self.state.try_lock() {
            Some(mut st) => self.service(&mut st),
            None => {
                self.regs.clear_bits(GAHBCFG, GAHBCFG_GLBINTRMASK);
                self.events.post(DEFERRED_IRQ);
            }
        }
    }

    /// Service an interrupt the ISR had to leave behind, then unmask the
    /// core again unless it was powered down meanwhile.
    fn service_deferred(&self) {
        let mut st = self.state.lock();
        self.service(&mut st);
        if st.initialized && st.port != PortState::NotPowered {
            self.regs.set_bits(GAHBCFG, GAHBCFG_GLBINTRMASK);
        }
    }

    fn service(&self, st: &mut HostState) {
        let gintsts = self.regs.read32(GINTSTS);
        self.regs.write32(GINTSTS, gintsts);

        let mut hprt = 0;
        if gintsts & GINTSTS_PRTINT != 0 {
            hprt = self.regs.read32(HPRT);
            // Acknowledge the change bits without disabling the port
            self.regs.write32(HPRT, hprt & !HPRT_ENA);
        }

        if let Some(hw) = decode_port_intr(gintsts, hprt, &st.flags) {
            if matches!(hw, HwPortEvent::Conn | HwPortEvent::Disconn) {
                self.lock_enable(st);
            }
            if let Some(event) = self.port_hw_event(st, hw) {
                st.last_event = Some(event);
                self.events.post(PORT_EVENT);
            }
        }

        if gintsts & GINTSTS_HCHINT != 0 {
            let haint = self.regs.read32(HAINT);
            for n in 0..st.channels.len() {
                if haint & (1 << n) != 0 {
                    self.channel_isr(st, n);
                }
            }
        }

        if gintsts & GINTSTS_SOF != 0 && self.regs.read32(GINTMSK) & GINTSTS_SOF != 0 {
            self.events.post(FRAME_EVENT);
        }
    }

    fn channel_isr(&self, st: &mut HostState, n: usize) {
        let raw = self.regs.read32(hcint(n));
        self.regs.write32(hcint(n), raw);

        let Some(ch) = st.channels[n].as_mut() else {
            log::warn!("[DWC2] Interrupt on idle channel {}: 0x{:03x}", n, raw);
            return;
        };
        ch.ctx.transfer_done = ch.transfer_done();
        let events = decode(ch.kind, HcInt::from_bits_truncate(raw), &mut ch.ctx);
        if events.is_empty() {
            return;
        }

        if events == ChanEvents::CPLT {
            if !ch.ctx.transfer_done {
                self.continue_transfer(n, ch);
                return;
            }
            self.post_channel(n, events | ChanEvents::DO_RELEASE);
        } else {
            self.post_channel(n, events);
        }
    }

    fn post_channel(&self, n: usize, events: ChanEvents) {
        self.chan_events[n].fetch_or(events.bits(), Ordering::AcqRel);
        self.events.post(chan_event_bit(n));
    }

    /// Worker body: the port event first, then every posted channel.
    pub fn process_events(&self) {
        let mut pending = self.events.take_all();
        if pending & DEFERRED_IRQ != 0 {
            self.service_deferred();
            pending |= self.events.take_all();
        }
        if pending & PORT_EVENT != 0 {
            self.handle_port_event();
        }
        for n in 0..self.chan_events.len() {
            if pending & chan_event_bit(n) != 0 {
                self.handle_chan_events(n);
            }
        }
        if pending & FRAME_EVENT != 0 {
            self.handle_frame();
        }
    }

    /// Enable every parked channel whose polling interval is up. SOF stays
    /// unmasked while any channel is still waiting.
    fn handle_frame(&self) {
        let mut st = self.state.lock();
        let frnum = self.frame_number();
        let mut waiting = false;
        for (n, slot) in st.channels.iter_mut().enumerate() {
            let Some(ch) = slot.as_mut() else {
                continue;
            };
            match ch.due {
                Some(due) if frame_reached(frnum, due) => {
                    ch.due = None;
                    self.enable_channel(n, ch);
                }
                Some(_) => waiting = true,
                None => {}
            }
        }
        if !waiting {
            self.regs.clear_bits(GINTMSK, GINTSTS_SOF);
        }
    }

    fn handle_chan_events(&self, n: usize) {
        let events = ChanEvents::from_bits_truncate(self.chan_events[n].swap(0, Ordering::AcqRel));
        if events.is_empty() {
            return;
        }

        let mut notes = Vec::new();
        let mut new_addr = None;
        {
            let mut st = self.state.lock();
            let Some(ch) = st.channels.get_mut(n).and_then(Option::as_mut) else {
                log::warn!("[DWC2] Events {:?} for idle channel {}", events, n);
                return;
            };

            if events.contains(ChanEvents::DO_RELEASE) {
                let result = if events.contains(ChanEvents::STALL) {
                    Err(UsbError::Stalled)
                } else if events.contains(ChanEvents::ERROR) {
                    if ch.ctx.halt_requested {
                        Err(UsbError::Aborted)
                    } else {
                        Err(UsbError::Io {
                            operation: "host channel transfer",
                        })
                    }
                } else {
                    Ok(())
                };
                new_addr = self.release(&mut st, n, result, &mut notes);
            } else if events.contains(ChanEvents::CPLT) {
                if ch.transfer_done() {
                    new_addr = self.release(&mut st, n, Ok(()), &mut notes);
                } else {
                    self.continue_transfer(n, ch);
                }
            } else {
                self.rearm(n, ch, events);
            }
        }

        if let Some(addr) = new_addr {
            log::debug!("[DWC2] Device address {} set", addr);
            self.clock.sleep_ms(self.config.set_addr_delay_ms);
        }
        self.deliver(notes);
    }

    fn deliver(&self, notes: Vec<Notification>) {
        for note in notes {
            match note {
                Notification::Event(event) => self.stack.submit_event(event),
                Notification::XferDone(xfer, result) => self.stack.xfer_return(xfer, result),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Test hooks
    // -----------------------------------------------------------------------

    /// Store `data` in the buffer of channel `n` the way its DMA would.
    #[cfg(test)]
    pub(crate) fn hw_fill(&self, n: usize, data: &[u8]) -> usize {
        let mut st = self.state.lock();
        st.channels
            .get_mut(n)
            .and_then(Option::as_mut)
            .and_then(|ch| ch.xfer.buf.as_mut())
            .map_or(0, |buf| buf.dma_fill(data))
    }

    #[cfg(test)]
    pub(crate) fn cur_stg(&self, n: usize) -> Option<u8> {
        let st = self.state.lock();
        st.channels
            .get(n)
            .and_then(Option::as_ref)
            .and_then(|ch| ch.ctrl)
            .map(|ctrl| ctrl.cur_stg())
    }

    #[cfg(test)]
    pub(crate) fn is_bound(&self, n: usize) -> bool {
        self.state
            .lock()
            .channels
            .get(n)
            .is_some_and(Option::is_some)
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.state.lock().pending.len()
    }

    #[cfg(test)]
    pub(crate) fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    /// Run `f` while holding the driver state, as the worker does.
    #[cfg(test)]
    pub(crate) fn with_state_held<T>(&self, f: impl FnOnce() -> T) -> T {
        let _st = self.state.lock();
        f()
    }
}
