//! Controller-level tests against a simulated DWC3 core

use alloc::{sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use super::{
    device::{Dwc3Device, SystemExitLatency, UdcEvent, UdcStack},
    event::link_state,
    regs::*,
    trb::{TrbCtrl, TrbType},
};
use crate::{
    config::Dwc3Config,
    drivers::usb::{
        buf::{BufFlags, UsbBuf},
        ch9::{EndpointType, SetupPacket, UsbDirection},
        control::ControlStage,
    },
    error::{UsbError, UsbResult},
    sim::{SimClock, SimRegs},
    sync::WorkScheduler,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    EpDone {
        ep: u8,
        data: Vec<u8>,
        result: UsbResult<()>,
    },
    Event(UdcEvent),
    SetupIn(SetupPacket),
    SetupOut(SetupPacket, Vec<u8>),
    SetupNoData(SetupPacket),
    StatusDone(u8),
    /// Address reported and the address DCFG held at that moment
    AddressApplied(u8, u32),
}

struct TestStack {
    regs: Arc<SimRegs>,
    calls: Mutex<Vec<Call>>,
}

impl TestStack {
    fn take(&self) -> Vec<Call> {
        core::mem::take(&mut *self.calls.lock())
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

fn setup_of(buf: &UsbBuf) -> SetupPacket {
    SetupPacket::parse(buf.data()).unwrap()
}

impl UdcStack for Arc<TestStack> {
    fn submit_ep_event(&self, buf: UsbBuf, result: UsbResult<()>) {
        self.record(Call::EpDone {
            ep: buf.ep(),
            data: buf.data().to_vec(),
            result,
        });
    }

    fn submit_event(&self, event: UdcEvent) {
        self.record(Call::Event(event));
    }

    fn ctrl_submit_s_in_status(&self, setup: UsbBuf) {
        self.record(Call::SetupIn(setup_of(&setup)));
    }

    fn ctrl_submit_s_out_status(&self, setup: UsbBuf, data: UsbBuf) {
        self.record(Call::SetupOut(setup_of(&setup), data.data().to_vec()));
    }

    fn ctrl_submit_s_status(&self, setup: UsbBuf) {
        self.record(Call::SetupNoData(setup_of(&setup)));
    }

    fn ctrl_submit_status(&self, status: UsbBuf) {
        self.record(Call::StatusDone(status.ep()));
    }

    fn address_applied(&self, addr: u8) {
        let dcfg = self.regs.peek(DCFG);
        self.record(Call::AddressApplied(
            addr,
            (dcfg & DCFG_DEVADDR_MASK) >> DCFG_DEVADDR_POS,
        ));
    }
}

#[derive(Default)]
struct TestWork {
    ep_work: Mutex<Vec<u8>>,
    event_delays: Mutex<Vec<u32>>,
}

impl WorkScheduler for Arc<TestWork> {
    fn submit_ep_work(&self, ep: u8) {
        self.ep_work.lock().push(ep);
    }

    fn schedule_event_work(&self, delay_ms: u32) {
        self.event_delays.lock().push(delay_ms);
    }
}

type TestUdc = Dwc3Device<Arc<SimRegs>, SimClock, Arc<TestStack>, Arc<TestWork>>;

struct Harness {
    regs: Arc<SimRegs>,
    stack: Arc<TestStack>,
    work: Arc<TestWork>,
    cmd_fail: Arc<AtomicBool>,
    udc: TestUdc,
}

/// A core that completes commands at once and models run/stop, soft reset
/// and the event count register.
fn sim_core(cmd_fail: Arc<AtomicBool>) -> Arc<SimRegs> {
    let regs = Arc::new(SimRegs::new());
    regs.poke(GSNPSID, 0x5533_290a);
    regs.poke(DSTS, DSTS_DEVCTRLHLT);

    regs.on_write(move |map, off, value, previous| {
        let depcmd_base = depcmd(0);
        if off >= depcmd_base && off < depcmd(32) && (off - depcmd_base) % 0x10 == 0 {
            let phys = ((off - depcmd_base) / 0x10) as u32;
            let mut done = value & !DEPCMD_CMDACT;
            if value & DEPCMD_CMD_MASK == DEPCMD_STARTTRANSFER {
                // Resource index equals the physical endpoint number
                done |= phys << DEPCMD_PARAM_POS;
            }
            if cmd_fail.load(Ordering::SeqCst) {
                done |= DEPCMD_STATUS_CMDERR << DEPCMD_STATUS_POS;
            }
            map.insert(off, done);
        } else if off == DGCMD {
            map.insert(off, value & !DGCMD_CMDACT);
        } else if off == DCTL {
            map.insert(off, value & !DCTL_CSFTRST);
            let dsts = map.get(&DSTS).copied().unwrap_or(0);
            let dsts = if value & DCTL_RUN_STOP != 0 {
                dsts & !DSTS_DEVCTRLHLT
            } else {
                dsts | DSTS_DEVCTRLHLT
            };
            map.insert(DSTS, dsts);
        } else if off == gevntcount(0) {
            map.insert(off, previous.saturating_sub(value));
        }
    });
    regs
}

fn ep_event(phys: u8, kind: u32, status: u32) -> u32 {
    ((phys as u32) << 1) | (kind << 6) | (status << 12)
}

fn dev_event(kind: u32, info: u32) -> u32 {
    1 | (kind << 8) | (info << 16)
}

const XFER_COMPLETE: u32 = 1;
const XFER_IN_PROGRESS: u32 = 2;

impl Harness {
    fn with_config(config: Dwc3Config) -> Self {
        let cmd_fail = Arc::new(AtomicBool::new(false));
        let regs = sim_core(cmd_fail.clone());
        let stack = Arc::new(TestStack {
            regs: regs.clone(),
            calls: Mutex::new(Vec::new()),
        });
        let work = Arc::new(TestWork::default());
        let udc = Dwc3Device::new(
            regs.clone(),
            SimClock::new(),
            stack.clone(),
            work.clone(),
            config,
        );
        Self {
            regs,
            stack,
            work,
            cmd_fail,
            udc,
        }
    }

    /// Initialized and running with the default configuration
    fn running() -> Self {
        Self::running_with(Dwc3Config::default())
    }

    fn running_with(config: Dwc3Config) -> Self {
        let h = Self::with_config(config);
        h.udc.init().unwrap();
        h.udc.enable().unwrap();
        h.work.event_delays.lock().clear();
        h
    }

    /// Deliver one event the way the core does: write it, then bump the count.
    fn post(&self, raw: u32) {
        self.udc.hw_post_event(raw);
        let count = self.regs.peek(gevntcount(0));
        self.regs.poke(gevntcount(0), count + 4);
    }

    fn run_events(&self) {
        while self.regs.peek(gevntcount(0)) & GEVNTCOUNT_MASK != 0 {
            self.udc.event_work();
        }
    }

    fn post_and_run(&self, raw: u32) {
        self.post(raw);
        self.run_events();
    }

    /// The core receives a SETUP packet on EP0 OUT.
    fn receive_setup(&self, bytes: [u8; 8]) {
        assert!(self.udc.hw_receive(0x00, &bytes));
        self.post_and_run(ep_event(0, XFER_COMPLETE, 0));
    }

    fn last_depcmd(&self, phys: u8) -> u32 {
        *self.regs.writes_to(depcmd(phys)).last().unwrap()
    }

    fn tail_trb(&self, ep: u8) -> super::trb::Trb {
        self.udc.with_ep(ep, |e| e.ring.trb(e.ring.tail())).unwrap()
    }

    fn enable_bulk_in(&self) {
        self.udc.ep_enable(0x81, EndpointType::Bulk, 64, 0).unwrap();
    }
}

fn data_buf(ep: u8, len: usize) -> UsbBuf {
    UsbBuf::from_slice(ep, &vec![0xa5; len])
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn test_init_programs_core() {
    let h = Harness::with_config(Dwc3Config::default());
    h.udc.init().unwrap();

    assert_eq!(h.regs.writes_to(DCTL)[0], DCTL_CSFTRST);
    assert_eq!(
        (h.regs.peek(GCTL) & GCTL_PRTCAPDIR_MASK) >> GCTL_PRTCAPDIR_POS,
        GCTL_PRTCAP_DEVICE
    );
    assert_eq!(h.regs.peek(gevntsiz(0)), 256 | GEVNTSIZ_INTMASK);
    assert_eq!(h.regs.peek(gtxfifosiz(1)), (256 << 16) | 256);
    assert_eq!(h.regs.peek(grxfifosiz(0)), 512);
    assert_eq!(h.regs.peek(DEVTEN), DEVTEN_DEFAULT);
    assert_eq!(h.regs.peek(DCFG) & DCFG_DEVSPD_MASK, SPEED_HIGH);
    assert_eq!(h.regs.peek(DALEPENA), 0b11);

    assert_eq!(
        h.regs.writes_to(depcmd(0)),
        [
            DEPCMD_DEPSTARTCFG | DEPCMD_CMDACT,
            DEPCMD_SETEPCONFIG | DEPCMD_CMDACT,
            DEPCMD_SETTRANSFRESOURCE | DEPCMD_CMDACT,
        ]
    );
    // EP0 is configured with a 64-byte max packet at high speed
    assert_eq!((h.regs.peek(depcmdpar0(1)) >> DEPCFG_MAX_PACKET_SIZE_POS) & 0x7ff, 64);
}

#[test]
fn test_init_rejects_unknown_core() {
    let h = Harness::with_config(Dwc3Config::default());
    h.regs.poke(GSNPSID, 0x4f54_300a);
    assert_eq!(h.udc.init(), Err(UsbError::NoDevice));
}

#[test]
fn test_enable_requires_init() {
    let h = Harness::with_config(Dwc3Config::default());
    assert!(matches!(h.udc.enable(), Err(UsbError::InvalidState { .. })));
}

#[test]
fn test_enable_arms_setup_and_runs() {
    let h = Harness::with_config(Dwc3Config::default());
    h.udc.init().unwrap();
    h.udc.enable().unwrap();

    let trb = h.tail_trb(0x00);
    assert!(trb.is_hw_owned());
    assert_eq!(trb.trb_type(), Some(TrbType::ControlSetup));
    assert_eq!(trb.remaining(), 8);
    assert!(trb.flags().contains(TrbCtrl::LST | TrbCtrl::IOC));
    assert_eq!(h.last_depcmd(0), DEPCMD_STARTTRANSFER | DEPCMD_CMDACT);

    assert_eq!(h.regs.peek(DSTS) & DSTS_DEVCTRLHLT, 0);
    assert_eq!(*h.work.event_delays.lock(), [0]);
}

#[test]
fn test_disable_halts_core() {
    let h = Harness::running();
    h.udc.disable().unwrap();
    assert_ne!(h.regs.peek(DSTS) & DSTS_DEVCTRLHLT, 0);
    assert_ne!(h.regs.peek(gevntsiz(0)) & GEVNTSIZ_INTMASK, 0);
}

#[test]
fn test_shutdown_aborts_and_disables_endpoints() {
    let h = Harness::running();
    h.enable_bulk_in();
    h.udc.ep_enqueue(data_buf(0x81, 10)).unwrap();
    h.udc.ep_work(0x81);

    h.udc.shutdown().unwrap();

    assert_eq!(
        h.stack.take(),
        [Call::EpDone {
            ep: 0x81,
            data: vec![0xa5; 10],
            result: Err(UsbError::Aborted),
        }]
    );
    assert_eq!(h.regs.peek(DALEPENA), 0);
    assert_eq!(h.regs.peek(DEVTEN), 0);
    assert!(matches!(
        h.udc.ep_enqueue(data_buf(0x81, 1)),
        Err(UsbError::InvalidState { .. })
    ));
}

// ---------------------------------------------------------------------------
// Bulk transfers
// ---------------------------------------------------------------------------

#[test]
fn test_bulk_in_chained_transfer() {
    let h = Harness::running();
    h.enable_bulk_in();

    for len in [64, 64, 10] {
        h.udc.ep_enqueue(data_buf(0x81, len)).unwrap();
    }
    assert_eq!(*h.work.ep_work.lock(), [0x81, 0x81, 0x81]);
    h.udc.ep_work(0x81);

    let chained: Vec<bool> = (0..3)
        .map(|slot| {
            h.udc
                .with_ep(0x81, |e| e.ring.trb(slot).flags().contains(TrbCtrl::CHN))
                .unwrap()
        })
        .collect();
    assert_eq!(chained, [true, true, false]);

    let cmds = h.regs.writes_to(depcmd(3));
    assert_eq!(
        cmds[cmds.len() - 3..],
        [
            DEPCMD_STARTTRANSFER | DEPCMD_CMDACT,
            DEPCMD_UPDATETRANSFER | (3 << DEPCMD_PARAM_POS) | DEPCMD_CMDACT,
            DEPCMD_UPDATETRANSFER | (3 << DEPCMD_PARAM_POS) | DEPCMD_CMDACT,
        ]
    );

    for _ in 0..3 {
        assert!(h.udc.hw_complete(0x81, 0));
    }
    h.post_and_run(ep_event(3, XFER_COMPLETE, 0));

    let calls = h.stack.take();
    let mut total = 0;
    for call in &calls {
        match call {
            Call::EpDone {
                ep: 0x81,
                data,
                result: Ok(()),
            } => total += data.len(),
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(calls.len(), 3);
    assert_eq!(total, 138);
    assert_eq!(h.udc.with_ep(0x81, |e| (e.total, e.started)), Some((0, false)));
}

#[test]
fn test_bulk_out_reports_received_length() {
    let h = Harness::running();
    h.udc.ep_enable(0x01, EndpointType::Bulk, 512, 0).unwrap();
    h.udc.ep_enqueue(UsbBuf::with_capacity(0x01, 512)).unwrap();
    h.udc.ep_work(0x01);

    let trb = h.tail_trb(0x01);
    assert!(trb.flags().contains(TrbCtrl::ISP_IMI));
    assert_eq!(trb.remaining(), 512);

    assert!(h.udc.hw_receive(0x01, b"hello"));
    h.post_and_run(ep_event(2, XFER_COMPLETE, 0));

    assert_eq!(
        h.stack.take(),
        [Call::EpDone {
            ep: 0x01,
            data: b"hello".to_vec(),
            result: Ok(()),
        }]
    );
}

#[test]
fn test_full_ring_keeps_buffers_pending() {
    let h = Harness::running_with(Dwc3Config {
        trb_num: 4,
        ..Dwc3Config::default()
    });
    h.enable_bulk_in();

    for _ in 0..4 {
        h.udc.ep_enqueue(data_buf(0x81, 10)).unwrap();
    }
    h.udc.ep_work(0x81);
    assert_eq!(
        h.udc.with_ep(0x81, |e| (e.ring.len(), e.pending.len())),
        Some((3, 1))
    );

    assert!(h.udc.hw_complete(0x81, 0));
    h.work.ep_work.lock().clear();
    h.post_and_run(ep_event(3, XFER_IN_PROGRESS, 0));
    assert_eq!(h.stack.take().len(), 1);
    assert_eq!(*h.work.ep_work.lock(), [0x81]);

    h.udc.ep_work(0x81);
    assert_eq!(
        h.udc.with_ep(0x81, |e| (e.ring.len(), e.pending.len(), e.started)),
        Some((3, 0, true))
    );
    assert_eq!(
        h.last_depcmd(3),
        DEPCMD_UPDATETRANSFER | (3 << DEPCMD_PARAM_POS) | DEPCMD_CMDACT
    );
}

#[test]
fn test_bus_error_fails_completed_buffers() {
    let h = Harness::running();
    h.enable_bulk_in();
    h.udc.ep_enqueue(data_buf(0x81, 10)).unwrap();
    h.udc.ep_work(0x81);
    assert!(h.udc.hw_complete(0x81, 10));
    h.post_and_run(ep_event(3, XFER_COMPLETE, 1));

    assert!(matches!(
        h.stack.take().as_slice(),
        [Call::EpDone {
            result: Err(UsbError::Io { .. }),
            ..
        }]
    ));
}

#[test]
fn test_enqueue_validates_endpoint() {
    let h = Harness::running();
    assert!(matches!(
        h.udc.ep_enqueue(data_buf(0x82, 4)),
        Err(UsbError::InvalidState { .. })
    ));
    assert!(matches!(
        h.udc.ep_enqueue(data_buf(0x8f, 4)),
        Err(UsbError::InvalidArgument { .. })
    ));
    h.enable_bulk_in();
    assert!(matches!(
        h.udc.ep_enable(0x81, EndpointType::Bulk, 64, 0),
        Err(UsbError::InvalidState { .. })
    ));
}

#[test]
fn test_ep_enable_allocates_resources_once() {
    let h = Harness::running();
    h.enable_bulk_in();
    h.udc.ep_enable(0x02, EndpointType::Interrupt, 8, 4).unwrap();

    let startcfg = DEPCMD_DEPSTARTCFG | (2 << DEPCMD_PARAM_POS) | DEPCMD_CMDACT;
    let count = h
        .regs
        .writes_to(depcmd(0))
        .iter()
        .filter(|&&c| c == startcfg)
        .count();
    assert_eq!(count, 1);
    assert_eq!(h.regs.peek(DALEPENA), 0b11 | (1 << 3) | (1 << 4));

    // bInterval - 1 lands in DEPCFG parameter 1
    let param1 = h.regs.peek(depcmdpar1(4));
    assert_eq!((param1 >> DEPCFG_BINTERVAL_M1_POS) & 0xff, 3);
    assert_eq!(param1 >> DEPCFG_EP_NUMBER_POS, 4);
}

#[test]
fn test_ep_enable_rejects_isochronous() {
    let h = Harness::running();
    let depcmds = h.regs.writes_to(depcmd(0)).len() + h.regs.writes_to(depcmd(3)).len();
    assert!(matches!(
        h.udc.ep_enable(0x81, EndpointType::Isochronous, 1024, 1),
        Err(UsbError::NotSupported { .. })
    ));
    assert_eq!(h.regs.peek(DALEPENA), 0b11);
    assert_eq!(
        h.regs.writes_to(depcmd(0)).len() + h.regs.writes_to(depcmd(3)).len(),
        depcmds
    );
    assert!(matches!(
        h.udc.ep_enqueue(data_buf(0x81, 4)),
        Err(UsbError::InvalidState { .. })
    ));
}

#[test]
fn test_dequeue_ends_transfer() {
    let h = Harness::running();
    h.enable_bulk_in();
    h.udc.ep_enqueue(data_buf(0x81, 10)).unwrap();
    h.udc.ep_enqueue(data_buf(0x81, 20)).unwrap();
    h.udc.ep_work(0x81);

    h.udc.ep_dequeue(0x81).unwrap();

    assert_eq!(
        h.last_depcmd(3),
        DEPCMD_ENDTRANSFER | (3 << DEPCMD_PARAM_POS) | DEPCMD_HIPRI_FORCERM | DEPCMD_CMDACT
    );
    let calls = h.stack.take();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| matches!(
        c,
        Call::EpDone {
            result: Err(UsbError::Aborted),
            ..
        }
    )));
    assert_eq!(
        h.udc.with_ep(0x81, |e| (e.started, e.ring.is_empty())),
        Some((false, true))
    );
}

#[test]
fn test_disable_endpoint() {
    let h = Harness::running();
    h.enable_bulk_in();
    h.udc.ep_disable(0x81).unwrap();
    assert_eq!(h.regs.peek(DALEPENA) & (1 << 3), 0);
    assert!(matches!(
        h.udc.ep_disable(0x81),
        Err(UsbError::InvalidState { .. })
    ));
}

// ---------------------------------------------------------------------------
// Stall
// ---------------------------------------------------------------------------

#[test]
fn test_set_halt_propagates_command_error() {
    let h = Harness::running();
    h.enable_bulk_in();

    h.cmd_fail.store(true, Ordering::SeqCst);
    assert_eq!(
        h.udc.ep_set_halt(0x81),
        Err(UsbError::CommandFailed {
            command: DEPCMD_SETSTALL,
            status: DEPCMD_STATUS_CMDERR,
        })
    );
    assert_eq!(h.udc.with_ep(0x81, |e| e.halted), Some(false));

    h.cmd_fail.store(false, Ordering::SeqCst);
    h.udc.ep_set_halt(0x81).unwrap();
    assert_eq!(h.udc.with_ep(0x81, |e| e.halted), Some(true));

    // Halted endpoints hold their buffers back
    h.udc.ep_enqueue(data_buf(0x81, 4)).unwrap();
    h.udc.ep_work(0x81);
    assert_eq!(h.udc.with_ep(0x81, |e| e.pending.len()), Some(1));

    h.udc.ep_clear_halt(0x81).unwrap();
    assert_eq!(h.last_depcmd(3), DEPCMD_CLEARSTALL | DEPCMD_CMDACT);
    h.udc.ep_work(0x81);
    assert_eq!(h.udc.with_ep(0x81, |e| e.ring.len()), Some(1));
}

#[test]
fn test_ep0_stall_rearms_setup() {
    let h = Harness::running();
    h.receive_setup([0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
    h.stack.take();

    h.udc.ep_set_halt(0x80).unwrap();
    assert!(h.regs.writes_to(depcmd(0)).contains(&(DEPCMD_SETSTALL | DEPCMD_CMDACT)));
    assert_eq!(h.udc.control_stage(), ControlStage::Setup);
    assert_eq!(h.tail_trb(0x00).trb_type(), Some(TrbType::ControlSetup));
}

// ---------------------------------------------------------------------------
// Control transfers
// ---------------------------------------------------------------------------

#[test]
fn test_set_address_applied_before_status() {
    let h = Harness::running();
    h.receive_setup([0x00, 0x05, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00]);

    let setup = SetupPacket {
        b_request: 0x05,
        w_value: 5,
        ..Default::default()
    };
    assert_eq!(
        h.stack.take(),
        [Call::AddressApplied(5, 5), Call::SetupNoData(setup)]
    );
    assert_eq!(h.udc.control_stage(), ControlStage::Status(UsbDirection::In));

    let status = UsbBuf::with_capacity(0x80, 0).with_flags(BufFlags::STATUS);
    h.udc.ep_enqueue(status).unwrap();
    assert_eq!(h.tail_trb(0x80).trb_type(), Some(TrbType::ControlStatus2));

    assert!(h.udc.hw_complete(0x80, 0));
    h.post_and_run(ep_event(1, XFER_COMPLETE, 0));

    assert_eq!(h.stack.take(), [Call::StatusDone(0x80)]);
    assert_eq!(h.udc.control_stage(), ControlStage::Setup);
    assert_eq!(h.tail_trb(0x00).trb_type(), Some(TrbType::ControlSetup));

    // The stack confirming the address is a no-op
    h.regs.clear_log();
    h.udc.set_address(5).unwrap();
    assert!(h.regs.writes_to(DCFG).is_empty());
}

#[test]
fn test_control_in_data_stage() {
    let h = Harness::running();
    h.receive_setup([0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);

    assert!(matches!(h.stack.take().as_slice(), [Call::SetupIn(s)] if s.w_length == 18));
    assert_eq!(h.udc.control_stage(), ControlStage::Data(UsbDirection::In));

    let desc = data_buf(0x80, 18).with_flags(BufFlags::DATA);
    h.udc.ep_enqueue(desc).unwrap();
    assert_eq!(h.tail_trb(0x80).trb_type(), Some(TrbType::ControlData));

    assert!(h.udc.hw_complete(0x80, 0));
    h.post_and_run(ep_event(1, XFER_COMPLETE, 0));

    assert_eq!(
        h.stack.take(),
        [Call::EpDone {
            ep: 0x80,
            data: vec![0xa5; 18],
            result: Ok(()),
        }]
    );
    // The driver queues the OUT status stage itself
    assert_eq!(h.udc.control_stage(), ControlStage::Status(UsbDirection::Out));
    assert_eq!(h.tail_trb(0x00).trb_type(), Some(TrbType::ControlStatus3));

    assert!(h.udc.hw_complete(0x00, 0));
    h.post_and_run(ep_event(0, XFER_COMPLETE, 0));
    assert_eq!(h.stack.take(), [Call::StatusDone(0x00)]);
    assert_eq!(h.tail_trb(0x00).trb_type(), Some(TrbType::ControlSetup));
}

#[test]
fn test_control_out_data_stage() {
    let h = Harness::running();
    h.receive_setup([0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00]);

    // Nothing is reported until the data stage arrives
    assert!(h.stack.take().is_empty());
    assert_eq!(h.udc.control_stage(), ControlStage::Data(UsbDirection::Out));
    assert_eq!(h.tail_trb(0x00).trb_type(), Some(TrbType::ControlData));

    assert!(h.udc.hw_receive(0x00, &[1, 2, 3, 4]));
    h.post_and_run(ep_event(0, XFER_COMPLETE, 0));

    match &h.stack.take()[..] {
        [Call::SetupOut(setup, data)] => {
            assert_eq!(setup.b_request, 0x07);
            assert_eq!(data, &[1, 2, 3, 4]);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.udc.control_stage(), ControlStage::Status(UsbDirection::In));

    let status = UsbBuf::with_capacity(0x80, 0).with_flags(BufFlags::STATUS);
    h.udc.ep_enqueue(status).unwrap();
    assert_eq!(h.tail_trb(0x80).trb_type(), Some(TrbType::ControlStatus3));
}

#[test]
fn test_control_buffer_must_match_stage() {
    let h = Harness::running();
    h.receive_setup([0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);

    let wrong_dir = UsbBuf::with_capacity(0x00, 18).with_flags(BufFlags::DATA);
    assert!(matches!(
        h.udc.ep_enqueue(wrong_dir),
        Err(UsbError::InvalidArgument { .. })
    ));
    let early_status = UsbBuf::with_capacity(0x80, 0).with_flags(BufFlags::STATUS);
    assert!(matches!(
        h.udc.ep_enqueue(early_status),
        Err(UsbError::InvalidArgument { .. })
    ));
}

// ---------------------------------------------------------------------------
// Device events
// ---------------------------------------------------------------------------

#[test]
fn test_usb_reset_aborts_transfers() {
    let h = Harness::running();
    h.enable_bulk_in();
    h.udc.ep_enqueue(data_buf(0x81, 10)).unwrap();
    h.udc.ep_work(0x81);

    h.post_and_run(dev_event(1, 0));

    assert_eq!(
        h.stack.take(),
        [
            Call::EpDone {
                ep: 0x81,
                data: vec![0xa5; 10],
                result: Err(UsbError::Aborted),
            },
            Call::Event(UdcEvent::Reset),
        ]
    );
    assert_eq!(
        h.last_depcmd(3),
        DEPCMD_ENDTRANSFER | (3 << DEPCMD_PARAM_POS) | DEPCMD_HIPRI_FORCERM | DEPCMD_CMDACT
    );
    assert_eq!(h.regs.peek(DCFG) & DCFG_DEVADDR_MASK, 0);
    assert_eq!(h.udc.control_stage(), ControlStage::Setup);
    assert_eq!(h.udc.with_ep(0x00, |e| e.ring.len()), Some(1));
}

#[test]
fn test_connect_done_reconfigures_ep0() {
    let h = Harness::running();
    h.regs.poke_bits(DSTS, SPEED_SUPER);
    h.post_and_run(dev_event(2, 0));

    assert_eq!(h.last_depcmd(1), DEPCMD_SETEPCONFIG | DEPCMD_CMDACT);
    let param0 = h.regs.peek(depcmdpar0(1));
    assert_eq!((param0 >> DEPCFG_MAX_PACKET_SIZE_POS) & 0x7ff, 512);
    assert_eq!(param0 & (3 << 30), DEPCFG_ACTION_MODIFY);
    assert_eq!(h.udc.device_speed(), crate::drivers::usb::ch9::UsbSpeed::Super);
}

#[test]
fn test_link_state_events() {
    let h = Harness::running();
    let link = |state: u8| dev_event(3, state as u32);

    h.post_and_run(link(link_state::U3));
    h.post_and_run(link(link_state::U3));
    h.post_and_run(link(link_state::U0));
    h.post_and_run(link(link_state::U0));
    h.post_and_run(dev_event(11, 0));
    h.post_and_run(dev_event(0, 0));

    assert_eq!(
        h.stack.take(),
        [
            Call::Event(UdcEvent::Suspend),
            Call::Event(UdcEvent::Resume),
            Call::Event(UdcEvent::Error),
            Call::Event(UdcEvent::Disconnected),
        ]
    );
}

#[test]
fn test_empty_poll_reschedules_with_delay() {
    let h = Harness::running();
    h.udc.event_work();
    assert_eq!(*h.work.event_delays.lock(), [1]);
}

#[test]
fn test_backlog_reschedules_immediately() {
    let h = Harness::running();
    h.post(dev_event(11, 0));
    h.post(dev_event(0, 0));

    h.udc.event_work();
    assert_eq!(*h.work.event_delays.lock(), [0]);
    h.udc.event_work();
    assert_eq!(*h.work.event_delays.lock(), [0, 1]);
    assert_eq!(h.stack.take().len(), 2);
}

#[test]
fn test_isr_masks_and_defers() {
    let h = Harness::running_with(Dwc3Config {
        use_irq: true,
        ..Dwc3Config::default()
    });
    assert_eq!(h.regs.peek(gevntsiz(0)) & GEVNTSIZ_INTMASK, 0);

    h.udc.isr();
    assert_ne!(h.regs.peek(gevntsiz(0)) & GEVNTSIZ_INTMASK, 0);
    assert_eq!(*h.work.event_delays.lock(), [0]);

    // An empty buffer unmasks instead of polling
    h.udc.event_work();
    assert_eq!(h.regs.peek(gevntsiz(0)) & GEVNTSIZ_INTMASK, 0);
    assert_eq!(*h.work.event_delays.lock(), [0]);
}

#[test]
fn test_system_exit_latency() {
    let h = Harness::running();
    let mut el = SystemExitLatency {
        u2pel: 100,
        ..Default::default()
    };
    h.udc.set_system_exit_latency(&el).unwrap();
    assert_eq!(h.regs.peek(DGCMDPAR), 100);

    el.u2pel = 200;
    h.udc.set_system_exit_latency(&el).unwrap();
    assert_eq!(h.regs.peek(DGCMDPAR), 0);
    assert_eq!(
        h.regs.writes_to(DGCMD),
        [
            DGCMD_SET_PERIODIC_PAR | DGCMD_CMDACT,
            DGCMD_SET_PERIODIC_PAR | DGCMD_CMDACT
        ]
    );
}
