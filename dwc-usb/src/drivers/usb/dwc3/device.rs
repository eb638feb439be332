//! DWC3 device controller
//!
//! [`Dwc3Device`] ties the TRB rings, the command channel and the event
//! buffer together behind the UDC driver API:
//!
//! - Buffers handed to [`Dwc3Device::ep_enqueue`] are queued per endpoint and
//!   moved onto the ring by [`Dwc3Device::ep_work`]. The first TRB of a
//!   transfer is started with DepStartXfer, later ones with DepUpdateXfer.
//! - [`Dwc3Device::event_work`] consumes one event per call, completes the
//!   buffers whose TRBs the core handed back and drives the EP0 control
//!   transfer through its stages.
//! - Callbacks into the stack are collected while the state lock is held
//!   and delivered after it is released, so the stack may call back into
//!   the driver from them.
//!
//! # Usage
//!
//! ```ignore
//! let udc = Dwc3Device::new(mmio, clock, stack, workqueue, Dwc3Config::default());
//! udc.init()?;
//! udc.enable()?;
//! // from the workqueue:
//! udc.event_work();
//! udc.ep_work(0x81);
//! ```

use alloc::vec::Vec;

use spin::Mutex;

use super::{
    cmd::{CommandChannel, DepCmd, DepCmdParams},
    endpoint::EpData,
    event::{
        decode_event, link_state, DevEventKind, Dwc3Event, EpEventKind, EventBuffer,
        DEPEVT_STATUS_BUSERR,
    },
    regs::*,
    trb::{Trb, TrbCtrl, TrbType},
};
use crate::{
    config::Dwc3Config,
    drivers::usb::{
        buf::{BufFlags, UsbBuf},
        ch9::{ep_addr as usb_ep, EndpointType, SetupPacket, UsbDirection, UsbSpeed},
        control::ControlStage,
    },
    error::{UsbError, UsbResult},
    mmio::{field_get, RegisterBlock},
    sync::WorkScheduler,
    timer::{poll_until, Clock},
};

/// Physical endpoints addressable by the core
const MAX_PHYS_EPS: usize = 32;

/// Bus-level events reported to the device stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdcEvent {
    Reset,
    Suspend,
    Resume,
    Disconnected,
    /// Erratic error or event buffer overflow
    Error,
}

/// U1/U2 exit latencies from SET_SEL
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemExitLatency {
    pub u1sel: u8,
    pub u1pel: u8,
    pub u2sel: u16,
    pub u2pel: u16,
}

/// The device stack above the controller driver
pub trait UdcStack: Send + Sync {
    /// Transfer completion, `Err(Aborted)` for cancelled buffers
    fn submit_ep_event(&self, buf: UsbBuf, result: UsbResult<()>);

    fn submit_event(&self, event: UdcEvent);

    /// SETUP received, an IN data stage follows
    fn ctrl_submit_s_in_status(&self, setup: UsbBuf);

    /// SETUP and OUT data stage received, status stage follows
    fn ctrl_submit_s_out_status(&self, setup: UsbBuf, data: UsbBuf);

    /// SETUP without data stage received, status stage follows
    fn ctrl_submit_s_status(&self, setup: UsbBuf);

    /// Status stage complete
    fn ctrl_submit_status(&self, status: UsbBuf);

    /// The address from a SET_ADDRESS request is live in hardware
    fn address_applied(&self, addr: u8);
}

/// Stack callbacks gathered under the state lock
enum Notification {
    EpDone(UsbBuf, UsbResult<()>),
    Event(UdcEvent),
    SetupInData(UsbBuf),
    OutDataDone(UsbBuf, UsbBuf),
    SetupNoData(UsbBuf),
    StatusDone(UsbBuf),
    AddressApplied(u8),
}

struct ControlState {
    stage: ControlStage,
    setup: SetupPacket,
    /// SETUP buffer kept until an OUT data stage completes
    setup_buf: Option<UsbBuf>,
}

impl ControlState {
    const fn new() -> Self {
        Self {
            stage: ControlStage::Setup,
            setup: SetupPacket {
                bm_request_type: 0,
                b_request: 0,
                w_value: 0,
                w_index: 0,
                w_length: 0,
            },
            setup_buf: None,
        }
    }
}

struct DeviceState {
    eps: Vec<Option<EpData>>,
    evbuf: EventBuffer,
    /// Next event buffer entry to consume
    evt_next: usize,
    ctrl: ControlState,
    initialized: bool,
    running: bool,
    /// DEPSTARTCFG for non-control endpoints issued since the last reset
    resources_configured: bool,
    suspended: bool,
}

/// Synopsys DWC3 USB device controller
pub struct Dwc3Device<R, C, S, W>
where
    R: RegisterBlock,
    C: Clock,
    S: UdcStack,
    W: WorkScheduler,
{
    regs: R,
    clock: C,
    stack: S,
    work: W,
    config: Dwc3Config,
    state: Mutex<DeviceState>,
}

fn ep_lookup(eps: &mut [Option<EpData>], addr: u8) -> UsbResult<&mut EpData> {
    eps.get_mut(phys_ep(addr) as usize)
        .and_then(Option::as_mut)
        .ok_or(UsbError::InvalidArgument {
            name: "ep",
            value: "endpoint not implemented",
        })
}

fn speed_from_bits(bits: u32) -> UsbSpeed {
    match bits {
        SPEED_SUPER | SPEED_SUPER_PLUS => UsbSpeed::Super,
        SPEED_HIGH => UsbSpeed::High,
        SPEED_LOW => UsbSpeed::Low,
        _ => UsbSpeed::Full,
    }
}

fn speed_bits(speed: UsbSpeed) -> u32 {
    match speed {
        UsbSpeed::Super => SPEED_SUPER,
        UsbSpeed::High => SPEED_HIGH,
        UsbSpeed::Full => SPEED_FULL_30_60,
        UsbSpeed::Low => SPEED_LOW,
    }
}

fn ep0_mps(speed: UsbSpeed) -> u16 {
    match speed {
        UsbSpeed::Super => 512,
        UsbSpeed::Low => 8,
        _ => 64,
    }
}

/// Account the bytes the core moved for a completed TRB.
fn complete_buf(buf: &mut UsbBuf, trb: &Trb) {
    if buf.is_in() {
        if trb.remaining() != 0 {
            log::debug!(
                "[DWC3] ep 0x{:02x} sent {} of {} bytes",
                buf.ep(),
                buf.len() - trb.remaining() as usize,
                buf.len()
            );
        }
    } else {
        let requested = buf.tailroom();
        buf.add(requested.saturating_sub(trb.remaining() as usize));
    }
}

impl<R, C, S, W> Dwc3Device<R, C, S, W>
where
    R: RegisterBlock,
    C: Clock,
    S: UdcStack,
    W: WorkScheduler,
{
    pub fn new(regs: R, clock: C, stack: S, work: W, config: Dwc3Config) -> Self {
        let mut eps = Vec::with_capacity(MAX_PHYS_EPS);
        for phys in 0..MAX_PHYS_EPS as u8 {
            let addr = ep_addr(phys);
            let index = usb_ep::index(addr);
            let present = if usb_ep::is_in(addr) {
                index < config.num_in_eps
            } else {
                index < config.num_out_eps
            };
            eps.push(present.then(|| EpData::new(addr, config.trb_num)));
        }

        Self {
            regs,
            clock,
            stack,
            work,
            state: Mutex::new(DeviceState {
                eps,
                evbuf: EventBuffer::new(config.events_num),
                evt_next: 0,
                ctrl: ControlState::new(),
                initialized: false,
                running: false,
                resources_configured: false,
                suspended: false,
            }),
            config,
        }
    }

    pub fn config(&self) -> &Dwc3Config {
        &self.config
    }

    fn cmd(&self) -> CommandChannel<'_, R, C> {
        CommandChannel::new(&self.regs, &self.clock, self.config.cmd_timeout_us)
    }

    // -----------------------------------------------------------------------
    // Controller lifecycle
    // -----------------------------------------------------------------------

    /// Reset and configure the core for device mode.
    pub fn init(&self) -> UsbResult<()> {
        self.config.validate()?;

        let id = self.regs.read32(GSNPSID) & GSNPSID_MASK;
        if id != GSNPSID_USB3 && id != GSNPSID_USB31 {
            log::error!("[DWC3] Unexpected core ID 0x{:08x}", id);
            return Err(UsbError::NoDevice);
        }

        let mut st = self.state.lock();

        self.regs.set_bits(DCTL, DCTL_CSFTRST);
        poll_until(
            &self.clock,
            self.config.reset_timeout_us,
            "DCTL soft reset",
            || self.regs.read32(DCTL) & DCTL_CSFTRST == 0,
        )?;

        self.regs.modify(
            GCTL,
            GCTL_PRTCAPDIR_MASK,
            GCTL_PRTCAP_DEVICE << GCTL_PRTCAPDIR_POS,
        );
        self.regs.modify(
            GSBUSCFG0,
            GSBUSCFG0_BRST_MASK,
            GSBUSCFG0_INCR4BRSTENA | GSBUSCFG0_INCR8BRSTENA | GSBUSCFG0_INCR16BRSTENA,
        );
        self.regs.clear_bits(gusb2phycfg(0), GUSB2PHYCFG_SUSPHY);
        self.regs.clear_bits(gusb3pipectl(0), GUSB3PIPECTL_SUSPHY);

        // TX FIFOs are laid out back to back, one per IN endpoint
        let depth = self.config.tx_fifo_words as u32;
        for n in 0..self.config.num_in_eps as usize {
            let start = n as u32 * depth;
            self.regs
                .write32(gtxfifosiz(n), (start << FIFOSIZ_START_POS) | depth);
        }
        self.regs
            .write32(grxfifosiz(0), self.config.rx_fifo_words as u32);

        let evbuf_addr = st.evbuf.dma_addr();
        let mut evntsiz = st.evbuf.size_bytes() as u32 & GEVNTSIZ_SIZE_MASK;
        if !self.config.use_irq {
            evntsiz |= GEVNTSIZ_INTMASK;
        }
        self.regs.write32(gevntadrlo(0), evbuf_addr as u32);
        self.regs.write32(gevntadrhi(0), (evbuf_addr >> 32) as u32);
        self.regs.write32(gevntsiz(0), evntsiz);
        self.regs.write32(gevntcount(0), 0);
        st.evt_next = 0;

        self.regs.modify(
            DCFG,
            DCFG_DEVSPD_MASK | DCFG_DEVADDR_MASK,
            speed_bits(self.config.max_speed),
        );
        self.regs.write32(DEVTEN, DEVTEN_DEFAULT);

        // EP0 gets transfer resources starting at zero
        self.cmd()
            .dep_cmd(0, DepCmd::StartConfig { rsc_base: 0 }, DepCmdParams::default())?;
        let mps = ep0_mps(self.config.max_speed);
        for addr in [usb_ep::EP0_OUT, usb_ep::EP0_IN] {
            let ep = ep_lookup(&mut st.eps, addr)?;
            ep.reset();
            ep.ep_type = EndpointType::Control;
            ep.mps = mps;
            self.configure_ep(ep, DEPCFG_ACTION_INIT)?;
            self.cmd().dep_cmd(
                ep.phys,
                DepCmd::SetTransferResource,
                DepCmdParams::new(DEPXFERCFG_NUM_XFER_RES, 0),
            )?;
            ep.enabled = true;
        }
        self.regs.write32(DALEPENA, 0b11);

        st.ctrl = ControlState::new();
        st.resources_configured = false;
        st.initialized = true;
        log::info!(
            "[DWC3] Core 0x{:08x} initialized, {} IN / {} OUT endpoints",
            self.regs.read32(GSNPSID),
            self.config.num_in_eps,
            self.config.num_out_eps
        );
        Ok(())
    }

    /// Arm EP0 for SETUP and connect to the bus.
    pub fn enable(&self) -> UsbResult<()> {
        {
            let mut st = self.state.lock();
            if !st.initialized {
                return Err(UsbError::InvalidState {
                    expected: "initialized",
                    actual: "uninitialized",
                });
            }
            if st.running {
                return Ok(());
            }

            self.feed_setup(&mut st)?;

            self.regs.set_bits(DCTL, DCTL_RUN_STOP);
            poll_until(
                &self.clock,
                self.config.reset_timeout_us,
                "DCTL run",
                || self.regs.read32(DSTS) & DSTS_DEVCTRLHLT == 0,
            )?;
            st.running = true;
        }

        if self.config.use_irq {
            self.regs.clear_bits(gevntsiz(0), GEVNTSIZ_INTMASK);
        }
        self.work.schedule_event_work(0);
        log::info!("[DWC3] Device controller running");
        Ok(())
    }

    /// Disconnect from the bus and halt the core.
    pub fn disable(&self) -> UsbResult<()> {
        let mut st = self.state.lock();
        if !st.running {
            return Ok(());
        }
        self.regs.set_bits(gevntsiz(0), GEVNTSIZ_INTMASK);
        self.regs.clear_bits(DCTL, DCTL_RUN_STOP);
        poll_until(
            &self.clock,
            self.config.reset_timeout_us,
            "DCTL halt",
            || self.regs.read32(DSTS) & DSTS_DEVCTRLHLT != 0,
        )?;
        st.running = false;
        log::info!("[DWC3] Device controller halted");
        Ok(())
    }

    /// Stop the controller and return every buffer it still owns.
    pub fn shutdown(&self) -> UsbResult<()> {
        self.disable()?;

        let mut notes = Vec::new();
        {
            let mut st = self.state.lock();
            for ep in st.eps.iter_mut().flatten() {
                if ep.started {
                    if let Err(e) = self.end_transfer(ep) {
                        log::warn!("[DWC3] ep 0x{:02x} end transfer: {}", ep.addr, e);
                    }
                }
                for buf in ep.reclaim_all() {
                    if !buf.is_setup() {
                        notes.push(Notification::EpDone(buf, Err(UsbError::Aborted)));
                    }
                }
                ep.reset();
            }
            self.regs.write32(DALEPENA, 0);
            self.regs.write32(DEVTEN, 0);
            st.ctrl = ControlState::new();
            st.initialized = false;
        }
        self.deliver(notes);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Endpoint API
    // -----------------------------------------------------------------------

    fn configure_ep(&self, ep: &EpData, action: u32) -> UsbResult<()> {
        let mut param0 = ((ep.ep_type as u32) << DEPCFG_EP_TYPE_POS)
            | ((ep.mps as u32) << DEPCFG_MAX_PACKET_SIZE_POS)
            | action;
        if ep.is_in() {
            param0 |= (usb_ep::index(ep.addr) as u32) << DEPCFG_FIFO_NUMBER_POS;
        }

        let mut param1 = DEPCFG_XFER_COMPLETE_EN
            | DEPCFG_XFER_IN_PROGRESS_EN
            | ((ep.phys as u32) << DEPCFG_EP_NUMBER_POS);
        if ep.ep_type == EndpointType::Control {
            param1 |= DEPCFG_XFER_NOT_READY_EN;
        }
        if ep.ep_type.is_periodic() && ep.interval > 0 {
            param1 |= ((ep.interval - 1) as u32) << DEPCFG_BINTERVAL_M1_POS;
        }

        self.cmd()
            .dep_cmd(ep.phys, DepCmd::SetEpConfig, DepCmdParams::new(param0, param1))?;
        Ok(())
    }

    /// Configure and activate a non-control endpoint.
    pub fn ep_enable(&self, addr: u8, ep_type: EndpointType, mps: u16, interval: u8) -> UsbResult<()> {
        if mps == 0 {
            return Err(UsbError::InvalidArgument {
                name: "mps",
                value: "zero",
            });
        }
        // Isochronous transfers must start on a microframe taken from XferNotReady
        if ep_type == EndpointType::Isochronous {
            log::error!("[DWC3] ep 0x{:02x}: isochronous endpoints are not supported", addr);
            return Err(UsbError::NotSupported {
                operation: "isochronous endpoint",
            });
        }

        let mut st = self.state.lock();
        if !usb_ep::is_control(addr) && !st.resources_configured {
            self.cmd()
                .dep_cmd(0, DepCmd::StartConfig { rsc_base: 2 }, DepCmdParams::default())?;
            st.resources_configured = true;
        }

        let ep = ep_lookup(&mut st.eps, addr)?;
        if ep.enabled && !usb_ep::is_control(addr) {
            return Err(UsbError::InvalidState {
                expected: "endpoint disabled",
                actual: "endpoint enabled",
            });
        }

        ep.ep_type = ep_type;
        ep.mps = mps;
        ep.interval = interval;
        self.configure_ep(ep, DEPCFG_ACTION_INIT)?;
        self.cmd().dep_cmd(
            ep.phys,
            DepCmd::SetTransferResource,
            DepCmdParams::new(DEPXFERCFG_NUM_XFER_RES, 0),
        )?;
        self.regs.set_bits(DALEPENA, 1 << ep.phys);

        ep.enabled = true;
        ep.halted = false;
        ep.total = 0;
        log::debug!("[DWC3] ep 0x{:02x} enabled, {:?} mps {}", addr, ep_type, mps);
        Ok(())
    }

    /// Deactivate an endpoint, aborting everything queued on it.
    pub fn ep_disable(&self, addr: u8) -> UsbResult<()> {
        let mut notes = Vec::new();
        {
            let mut st = self.state.lock();
            let ep = ep_lookup(&mut st.eps, addr)?;
            if !ep.enabled {
                return Err(UsbError::InvalidState {
                    expected: "endpoint enabled",
                    actual: "endpoint disabled",
                });
            }
            if ep.started {
                self.end_transfer(ep)?;
            }
            for buf in ep.reclaim_all() {
                notes.push(Notification::EpDone(buf, Err(UsbError::Aborted)));
            }
            self.regs.clear_bits(DALEPENA, 1 << ep.phys);
            ep.reset();
        }
        self.deliver(notes);
        Ok(())
    }

    /// Queue a buffer. Control buffers go straight to the ring, others are
    /// moved there by [`Dwc3Device::ep_work`].
    pub fn ep_enqueue(&self, buf: UsbBuf) -> UsbResult<()> {
        let addr = buf.ep();
        let mut st = self.state.lock();

        if usb_ep::is_control(addr) {
            return self.ctrl_enqueue(&mut st, buf);
        }

        let ep = ep_lookup(&mut st.eps, addr)?;
        ep.ensure_enabled()?;
        ep.pending.push_back(buf);
        drop(st);

        self.work.submit_ep_work(addr);
        Ok(())
    }

    /// Abort every buffer queued on an endpoint.
    pub fn ep_dequeue(&self, addr: u8) -> UsbResult<()> {
        let mut notes = Vec::new();
        {
            let mut st = self.state.lock();
            if usb_ep::is_control(addr) {
                self.reset_control(&mut st, &mut notes);
                self.feed_setup(&mut st)?;
            } else {
                let ep = ep_lookup(&mut st.eps, addr)?;
                if ep.started {
                    self.end_transfer(ep)?;
                }
                for buf in ep.reclaim_all() {
                    notes.push(Notification::EpDone(buf, Err(UsbError::Aborted)));
                }
            }
        }
        self.deliver(notes);
        Ok(())
    }

    pub fn ep_set_halt(&self, addr: u8) -> UsbResult<()> {
        let mut notes = Vec::new();
        {
            let mut st = self.state.lock();
            if usb_ep::is_control(addr) {
                // A control stall ends the transfer, the next SETUP clears it
                self.cmd()
                    .dep_cmd(0, DepCmd::SetStall, DepCmdParams::default())?;
                self.reset_control(&mut st, &mut notes);
                self.feed_setup(&mut st)?;
            } else {
                let ep = ep_lookup(&mut st.eps, addr)?;
                self.cmd()
                    .dep_cmd(ep.phys, DepCmd::SetStall, DepCmdParams::default())?;
                ep.halted = true;
            }
        }
        log::debug!("[DWC3] ep 0x{:02x} halted", addr);
        self.deliver(notes);
        Ok(())
    }

    pub fn ep_clear_halt(&self, addr: u8) -> UsbResult<()> {
        if usb_ep::is_control(addr) {
            return Ok(());
        }
        {
            let mut st = self.state.lock();
            let ep = ep_lookup(&mut st.eps, addr)?;
            self.cmd()
                .dep_cmd(ep.phys, DepCmd::ClearStall, DepCmdParams::default())?;
            ep.halted = false;
        }
        self.work.submit_ep_work(addr);
        Ok(())
    }

    /// Move pending buffers of `addr` onto its ring while there is room.
    pub fn ep_work(&self, addr: u8) {
        let mut st = self.state.lock();
        let Ok(ep) = ep_lookup(&mut st.eps, addr) else {
            log::warn!("[DWC3] work for unknown ep 0x{:02x}", addr);
            return;
        };
        if !ep.enabled || ep.halted {
            return;
        }

        while let Some(buf) = ep.pending.pop_front() {
            match ep.push_bulk(buf) {
                Ok(slot) => {
                    if let Err(e) = self.kick(ep, slot) {
                        log::error!("[DWC3] ep 0x{:02x} transfer not started: {}", addr, e);
                        break;
                    }
                }
                Err(buf) => {
                    // Ring full, retried when a completion frees a slot
                    ep.pending.push_front(buf);
                    break;
                }
            }
        }
    }

    /// Start or update the transfer after a TRB landed in `slot`.
    fn kick(&self, ep: &mut EpData, slot: usize) -> UsbResult<()> {
        if ep.started {
            self.cmd().dep_cmd(
                ep.phys,
                DepCmd::UpdateTransfer {
                    rsc: ep.xferrscidx,
                },
                DepCmdParams::default(),
            )?;
        } else {
            let params = DepCmdParams::trb(ep.ring.trb_dma_addr(slot));
            ep.xferrscidx = self.cmd().dep_cmd(ep.phys, DepCmd::StartTransfer, params)?;
            ep.started = true;
        }
        Ok(())
    }

    fn end_transfer(&self, ep: &mut EpData) -> UsbResult<()> {
        let cmd = DepCmd::EndTransfer {
            rsc: ep.xferrscidx,
            force: true,
        };
        ep.started = false;
        self.cmd().dep_cmd(ep.phys, cmd, DepCmdParams::default())?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Device API
    // -----------------------------------------------------------------------

    fn apply_address(&self, addr: u8) {
        self.regs.modify(
            DCFG,
            DCFG_DEVADDR_MASK,
            (addr as u32) << DCFG_DEVADDR_POS,
        );
    }

    /// Program the device address. A SET_ADDRESS request already applied it
    /// on SETUP completion, so this usually only confirms it.
    pub fn set_address(&self, addr: u8) -> UsbResult<()> {
        if addr > 127 {
            return Err(UsbError::InvalidArgument {
                name: "addr",
                value: "above 127",
            });
        }
        let current = field_get(self.regs.read32(DCFG), DCFG_DEVADDR_MASK, DCFG_DEVADDR_POS);
        if current == addr as u32 {
            log::debug!("[DWC3] address {} already set", addr);
            return Ok(());
        }
        self.apply_address(addr);
        Ok(())
    }

    pub fn set_system_exit_latency(&self, el: &SystemExitLatency) -> UsbResult<()> {
        let param = if el.u2pel > 125 { 0 } else { el.u2pel as u32 };
        self.cmd().gen_cmd(DGCMD_SET_PERIODIC_PAR, param)
    }

    /// Speed negotiated on the bus
    pub fn device_speed(&self) -> UsbSpeed {
        speed_from_bits(self.regs.read32(DSTS) & DSTS_CONNECTSPD_MASK)
    }

    // -----------------------------------------------------------------------
    // Control endpoint
    // -----------------------------------------------------------------------

    fn ep0_push(&self, st: &mut DeviceState, buf: UsbBuf, ty: TrbType) -> UsbResult<()> {
        let mut flags = TrbCtrl::LST | TrbCtrl::IOC;
        if !buf.is_in() {
            flags |= TrbCtrl::ISP_IMI;
        }
        let ep = ep_lookup(&mut st.eps, buf.ep())?;
        let slot = ep.ring.push(buf, ty, flags)?;
        self.kick(ep, slot)
    }

    /// Queue the next SETUP buffer on EP0 OUT unless one is waiting already.
    fn feed_setup(&self, st: &mut DeviceState) -> UsbResult<()> {
        st.ctrl.stage = ControlStage::Setup;
        if !ep_lookup(&mut st.eps, usb_ep::EP0_OUT)?.ring.is_empty() {
            return Ok(());
        }
        let buf = UsbBuf::with_capacity(usb_ep::EP0_OUT, SetupPacket::SIZE)
            .with_flags(BufFlags::SETUP);
        self.ep0_push(st, buf, TrbType::ControlSetup)
    }

    fn ctrl_enqueue(&self, st: &mut DeviceState, buf: UsbBuf) -> UsbResult<()> {
        let dir = usb_ep::direction(buf.ep());
        let ty = match st.ctrl.stage {
            ControlStage::Data(d) if d == dir && buf.is_data() => TrbType::ControlData,
            ControlStage::Status(d) if d == dir && buf.is_status() => {
                if st.ctrl.setup.has_data_stage() {
                    TrbType::ControlStatus3
                } else {
                    TrbType::ControlStatus2
                }
            }
            stage => {
                log::warn!(
                    "[DWC3] ep 0x{:02x} buffer {:?} does not fit stage {:?}",
                    buf.ep(),
                    buf.flags(),
                    stage
                );
                return Err(UsbError::InvalidArgument {
                    name: "buf",
                    value: "does not match the control stage",
                });
            }
        };
        self.ep0_push(st, buf, ty)
    }

    /// End transfers on both EP0 directions and return stack-owned buffers.
    fn reset_control(&self, st: &mut DeviceState, notes: &mut Vec<Notification>) {
        for addr in [usb_ep::EP0_OUT, usb_ep::EP0_IN] {
            let Ok(ep) = ep_lookup(&mut st.eps, addr) else {
                continue;
            };
            if ep.started {
                if let Err(e) = self.end_transfer(ep) {
                    log::warn!("[DWC3] ep 0x{:02x} end transfer: {}", addr, e);
                }
            }
            for buf in ep.reclaim_all() {
                if !buf.is_setup() {
                    notes.push(Notification::EpDone(buf, Err(UsbError::Aborted)));
                }
            }
        }
        st.ctrl = ControlState::new();
    }

    fn ep0_xfer_done(&self, st: &mut DeviceState, phys: u8, status: u8, notes: &mut Vec<Notification>) {
        let (mut buf, trb) = {
            let Some(ep) = st.eps.get_mut(phys as usize).and_then(Option::as_mut) else {
                return;
            };
            if ep.ring.completed_tail().is_none() {
                log::warn!("[DWC3] ep{} completion without a finished TRB", phys);
                return;
            }
            let Some(done) = ep.ring.pop() else {
                return;
            };
            // Every EP0 TRB is the last of its transfer
            ep.started = false;
            done
        };
        complete_buf(&mut buf, &trb);

        if status & DEPEVT_STATUS_BUSERR != 0 {
            log::error!("[DWC3] ep{} bus error in {:?}", phys, st.ctrl.stage);
            if !buf.is_setup() {
                notes.push(Notification::EpDone(buf, Err(UsbError::Io { operation: "ep0" })));
            }
            self.reset_control(st, notes);
            if let Err(e) = self.feed_setup(st) {
                log::error!("[DWC3] cannot rearm SETUP: {}", e);
            }
            return;
        }

        let ret = if buf.is_setup() {
            self.setup_done(st, buf, notes)
        } else if buf.is_data() {
            self.data_done(st, buf, notes)
        } else if buf.is_status() {
            st.ctrl.stage = ControlStage::Setup;
            notes.push(Notification::StatusDone(buf));
            self.feed_setup(st)
        } else {
            notes.push(Notification::EpDone(buf, Ok(())));
            Ok(())
        };
        if let Err(e) = ret {
            log::error!("[DWC3] control transfer failed: {}", e);
        }
    }

    fn setup_done(&self, st: &mut DeviceState, buf: UsbBuf, notes: &mut Vec<Notification>) -> UsbResult<()> {
        let setup = match SetupPacket::parse(buf.data()) {
            Ok(setup) => setup,
            Err(e) => {
                log::error!("[DWC3] short SETUP ({} bytes)", buf.len());
                self.feed_setup(st)?;
                return Err(e);
            }
        };
        log::trace!("[DWC3] SETUP {:?}", setup);

        // Apply the address before the stack processes the request so the
        // status stage already completes at the new address
        if let Some(addr) = setup.set_address_target() {
            self.apply_address(addr);
            notes.push(Notification::AddressApplied(addr));
        }

        st.ctrl.setup = setup;
        st.ctrl.stage = ControlStage::after_setup(&setup);
        match st.ctrl.stage {
            ControlStage::Data(UsbDirection::In) => {
                notes.push(Notification::SetupInData(buf));
                Ok(())
            }
            ControlStage::Data(UsbDirection::Out) => {
                st.ctrl.setup_buf = Some(buf);
                let data = UsbBuf::with_capacity(usb_ep::EP0_OUT, setup.w_length as usize)
                    .with_flags(BufFlags::DATA);
                self.ep0_push(st, data, TrbType::ControlData)
            }
            _ => {
                notes.push(Notification::SetupNoData(buf));
                Ok(())
            }
        }
    }

    fn data_done(&self, st: &mut DeviceState, buf: UsbBuf, notes: &mut Vec<Notification>) -> UsbResult<()> {
        st.ctrl.stage = st.ctrl.stage.next(&st.ctrl.setup);
        if buf.is_in() {
            notes.push(Notification::EpDone(buf, Ok(())));
            let status = UsbBuf::with_capacity(usb_ep::EP0_OUT, 0).with_flags(BufFlags::STATUS);
            self.ep0_push(st, status, TrbType::ControlStatus3)
        } else {
            let setup = match st.ctrl.setup_buf.take() {
                Some(setup) => setup,
                None => UsbBuf::from_slice(usb_ep::EP0_OUT, &st.ctrl.setup.to_bytes())
                    .with_flags(BufFlags::SETUP),
            };
            notes.push(Notification::OutDataDone(setup, buf));
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Interrupt handler: mask the event interrupt and hand off to the
    /// event worker.
    pub fn isr(&self) {
        self.regs.set_bits(gevntsiz(0), GEVNTSIZ_INTMASK);
        self.work.schedule_event_work(0);
    }

    /// Consume one event from the event buffer.
    pub fn event_work(&self) {
        let mut notes = Vec::new();
        let more = {
            let mut st = self.state.lock();
            if !st.initialized {
                return;
            }

            let count = self.regs.read32(gevntcount(0)) & GEVNTCOUNT_MASK;
            if count == 0 {
                drop(st);
                self.idle_events();
                return;
            }

            let raw = st.evbuf.read(st.evt_next);
            st.evt_next = (st.evt_next + 1) % st.evbuf.entries();
            // The count register is decremented by the value written
            self.regs.write32(gevntcount(0), 4);

            let event = decode_event(raw);
            log::trace!("[DWC3] event 0x{:08x}: {:?}", raw, event);
            self.handle_event(&mut st, event, &mut notes);
            count > 4
        };

        self.deliver(notes);
        if more {
            self.work.schedule_event_work(0);
        } else {
            self.idle_events();
        }
    }

    fn idle_events(&self) {
        if self.config.use_irq {
            self.regs.clear_bits(gevntsiz(0), GEVNTSIZ_INTMASK);
        } else {
            self.work.schedule_event_work(self.config.event_poll_delay_ms);
        }
    }

    fn handle_event(&self, st: &mut DeviceState, event: Dwc3Event, notes: &mut Vec<Notification>) {
        match event {
            Dwc3Event::Endpoint {
                phys, kind, status, ..
            } => match kind {
                EpEventKind::XferComplete | EpEventKind::XferInProgress => {
                    if phys < 2 {
                        self.ep0_xfer_done(st, phys, status, notes);
                    } else {
                        self.ep_xfer_done(st, phys, kind, status, notes);
                    }
                }
                EpEventKind::XferNotReady => {
                    // Only isochronous starts depend on it, and those are refused
                    log::trace!("[DWC3] ep{} transfer not ready", phys);
                }
                other => {
                    log::debug!("[DWC3] ep{} event {:?} ignored", phys, other);
                }
            },
            Dwc3Event::Device { kind, info } => self.handle_device_event(st, kind, info, notes),
        }
    }

    fn ep_xfer_done(
        &self,
        st: &mut DeviceState,
        phys: u8,
        kind: EpEventKind,
        status: u8,
        notes: &mut Vec<Notification>,
    ) {
        let Some(ep) = st.eps.get_mut(phys as usize).and_then(Option::as_mut) else {
            log::warn!("[DWC3] event for unknown ep{}", phys);
            return;
        };

        let result = if status & DEPEVT_STATUS_BUSERR != 0 {
            log::error!("[DWC3] ep 0x{:02x} bus error", ep.addr);
            Err(UsbError::Io {
                operation: "transfer",
            })
        } else {
            Ok(())
        };

        while ep.ring.completed_tail().is_some() {
            let Some((mut buf, trb)) = ep.ring.pop() else {
                break;
            };
            complete_buf(&mut buf, &trb);
            notes.push(Notification::EpDone(buf, result));
        }
        if kind == EpEventKind::XferComplete {
            ep.started = false;
        }

        self.work.submit_ep_work(ep.addr);
    }

    fn handle_device_event(&self, st: &mut DeviceState, kind: DevEventKind, info: u16, notes: &mut Vec<Notification>) {
        match kind {
            DevEventKind::Reset => self.usb_reset(st, notes),
            DevEventKind::ConnectDone => self.connect_done(st),
            DevEventKind::Disconnect => {
                log::info!("[DWC3] Disconnected");
                st.suspended = false;
                notes.push(Notification::Event(UdcEvent::Disconnected));
            }
            DevEventKind::LinkStatusChange => {
                let state = (info & 0xf) as u8;
                log::debug!("[DWC3] link state {:#x}", state);
                match state {
                    link_state::U3 if !st.suspended => {
                        st.suspended = true;
                        notes.push(Notification::Event(UdcEvent::Suspend));
                    }
                    link_state::U0 | link_state::RESUME if st.suspended => {
                        st.suspended = false;
                        notes.push(Notification::Event(UdcEvent::Resume));
                    }
                    _ => {}
                }
            }
            DevEventKind::Wakeup => {
                if st.suspended {
                    st.suspended = false;
                    notes.push(Notification::Event(UdcEvent::Resume));
                }
            }
            DevEventKind::ErraticError | DevEventKind::Overflow => {
                log::error!("[DWC3] controller error event {:?}", kind);
                notes.push(Notification::Event(UdcEvent::Error));
            }
            other => {
                log::debug!("[DWC3] device event {:?} ignored", other);
            }
        }
    }

    /// USB reset: end every transfer, drop the address and rearm EP0.
    fn usb_reset(&self, st: &mut DeviceState, notes: &mut Vec<Notification>) {
        log::info!("[DWC3] USB reset");
        st.suspended = false;

        for ep in st.eps.iter_mut().skip(2).flatten() {
            if !ep.enabled {
                continue;
            }
            if ep.started {
                if let Err(e) = self.end_transfer(ep) {
                    log::warn!("[DWC3] ep 0x{:02x} end transfer: {}", ep.addr, e);
                }
            }
            if ep.halted {
                match self
                    .cmd()
                    .dep_cmd(ep.phys, DepCmd::ClearStall, DepCmdParams::default())
                {
                    Ok(_) => ep.halted = false,
                    Err(e) => log::warn!("[DWC3] ep 0x{:02x} clear stall: {}", ep.addr, e),
                }
            }
            for buf in ep.reclaim_all() {
                notes.push(Notification::EpDone(buf, Err(UsbError::Aborted)));
            }
        }

        self.reset_control(st, notes);
        self.apply_address(0);
        st.resources_configured = false;
        notes.push(Notification::Event(UdcEvent::Reset));

        if let Err(e) = self.feed_setup(st) {
            log::error!("[DWC3] cannot rearm SETUP after reset: {}", e);
        }
    }

    fn connect_done(&self, st: &mut DeviceState) {
        let speed = self.device_speed();
        let mps = ep0_mps(speed);
        log::info!("[DWC3] Connected at {:?} speed", speed);

        for addr in [usb_ep::EP0_OUT, usb_ep::EP0_IN] {
            let Ok(ep) = ep_lookup(&mut st.eps, addr) else {
                continue;
            };
            ep.mps = mps;
            if let Err(e) = self.configure_ep(ep, DEPCFG_ACTION_MODIFY) {
                log::error!("[DWC3] ep 0x{:02x} reconfigure: {}", addr, e);
            }
        }
    }

    fn deliver(&self, notes: Vec<Notification>) {
        for note in notes {
            match note {
                Notification::EpDone(buf, result) => self.stack.submit_ep_event(buf, result),
                Notification::Event(event) => self.stack.submit_event(event),
                Notification::SetupInData(setup) => self.stack.ctrl_submit_s_in_status(setup),
                Notification::OutDataDone(setup, data) => {
                    self.stack.ctrl_submit_s_out_status(setup, data)
                }
                Notification::SetupNoData(setup) => self.stack.ctrl_submit_s_status(setup),
                Notification::StatusDone(buf) => self.stack.ctrl_submit_status(buf),
                Notification::AddressApplied(addr) => self.stack.address_applied(addr),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Simulation hooks
    // -----------------------------------------------------------------------

    /// Write an event where the core would put the next one. The caller
    /// bumps GEVNTCOUNT.
    #[cfg(test)]
    pub(crate) fn hw_post_event(&self, raw: u32) {
        let mut st = self.state.lock();
        let pending = (self.regs.read32(gevntcount(0)) & GEVNTCOUNT_MASK) as usize / 4;
        let index = st.evt_next + pending;
        st.evbuf.hw_write(index, raw);
    }

    #[cfg(test)]
    pub(crate) fn hw_complete(&self, addr: u8, remaining: u32) -> bool {
        let mut st = self.state.lock();
        ep_lookup(&mut st.eps, addr).is_ok_and(|ep| ep.ring.hw_complete(remaining))
    }

    #[cfg(test)]
    pub(crate) fn hw_receive(&self, addr: u8, data: &[u8]) -> bool {
        let mut st = self.state.lock();
        ep_lookup(&mut st.eps, addr).is_ok_and(|ep| ep.ring.hw_receive(data))
    }

    #[cfg(test)]
    pub(crate) fn with_ep<T>(&self, addr: u8, f: impl FnOnce(&EpData) -> T) -> Option<T> {
        let mut st = self.state.lock();
        ep_lookup(&mut st.eps, addr).ok().map(|ep| f(ep))
    }

    #[cfg(test)]
    pub(crate) fn control_stage(&self) -> ControlStage {
        self.state.lock().ctrl.stage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_mapping() {
        assert_eq!(speed_from_bits(SPEED_SUPER), UsbSpeed::Super);
        assert_eq!(speed_from_bits(SPEED_FULL_48), UsbSpeed::Full);
        assert_eq!(speed_from_bits(SPEED_LOW), UsbSpeed::Low);
        assert_eq!(speed_bits(UsbSpeed::High), SPEED_HIGH);
        assert_eq!(ep0_mps(UsbSpeed::Super), 512);
        assert_eq!(ep0_mps(UsbSpeed::Full), 64);
    }

    #[test]
    fn test_complete_buf_out_accounts_received_bytes() {
        let mut buf = UsbBuf::with_capacity(0x02, 64);
        let trb = Trb {
            size: 54,
            ..Trb::default()
        };
        complete_buf(&mut buf, &trb);
        assert_eq!(buf.len(), 10);
    }
}
