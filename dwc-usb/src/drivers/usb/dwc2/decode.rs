//! Host channel interrupt decode table
//!
//! [`decode`] maps one channel interrupt, read from `HCINT`, onto the
//! [`ChanEvents`] the driver acts on. The branch is picked from the
//! channel's [`ChannelKind`] (endpoint type, split or not, direction); every
//! branch is a plain function of the raw bits and the retry state the
//! channel carries from one interrupt to the next.
//!
//! | type           | non-split                 | split                             |
//! |----------------|---------------------------|-----------------------------------|
//! | control, bulk  | `async_in`, `async_out`   | `split_async`                     |
//! | interrupt      | `periodic_intr`           | `split_intr`                      |
//! | isochronous    | `periodic_isoc`           | `split_isoc_in`, `split_isoc_out` |
//!
//! Every outcome carrying `ERROR` or `STALL` also carries `DO_RELEASE`.

use super::channel::{ChanEvents, ChannelKind, HcInt, RetryState};
use crate::drivers::usb::ch9::{EndpointType, UsbDirection};

/// Consecutive XACTERRs tolerated on a non-split IN channel
const ASYNC_IN_ERROR_LIMIT: u8 = 2;
/// Error count at which every other branch gives up
const ERROR_LIMIT: u8 = 3;

/// Per-channel state the decode table reads and updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeCtx {
    pub retry: RetryState,
    /// The whole transfer is done once the current stage completes
    pub transfer_done: bool,
    /// Software asked the channel to halt
    pub halt_requested: bool,
}

impl DecodeCtx {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            retry: RetryState::new(kind),
            transfer_done: true,
            halt_requested: false,
        }
    }
}

type Branch = fn(UsbDirection, HcInt, &mut DecodeCtx) -> ChanEvents;

fn branch(kind: ChannelKind) -> Branch {
    match (kind.ep_type, kind.split, kind.direction) {
        (EndpointType::Control | EndpointType::Bulk, false, UsbDirection::In) => async_in,
        (EndpointType::Control | EndpointType::Bulk, false, UsbDirection::Out) => async_out,
        (EndpointType::Control | EndpointType::Bulk, true, _) => split_async,
        (EndpointType::Interrupt, false, _) => periodic_intr,
        (EndpointType::Interrupt, true, _) => split_intr,
        (EndpointType::Isochronous, false, _) => periodic_isoc,
        (EndpointType::Isochronous, true, UsbDirection::In) => split_isoc_in,
        (EndpointType::Isochronous, true, UsbDirection::Out) => split_isoc_out,
    }
}

/// Decode one channel interrupt.
pub fn decode(kind: ChannelKind, hcint: HcInt, ctx: &mut DecodeCtx) -> ChanEvents {
    if ctx.halt_requested || hcint.contains(HcInt::AHBERR) {
        return fail();
    }
    branch(kind)(kind.direction, hcint, ctx)
}

fn fail() -> ChanEvents {
    ChanEvents::ERROR | ChanEvents::DO_RELEASE
}

fn stall() -> ChanEvents {
    ChanEvents::STALL | ChanEvents::DO_RELEASE
}

/// Count one transaction error; `retry` is the outcome below `limit`.
fn count_error(ctx: &mut DecodeCtx, limit: u8, retry: ChanEvents) -> ChanEvents {
    ctx.retry.error_count = ctx.retry.error_count.saturating_add(1);
    if ctx.retry.error_count >= limit {
        fail()
    } else {
        retry
    }
}

fn completed(ctx: &DecodeCtx, more: ChanEvents) -> ChanEvents {
    if ctx.transfer_done {
        ChanEvents::CPLT
    } else {
        more
    }
}

// ---------------------------------------------------------------------------
// Control and bulk
// ---------------------------------------------------------------------------

fn async_in(_dir: UsbDirection, hcint: HcInt, ctx: &mut DecodeCtx) -> ChanEvents {
    if hcint.contains(HcInt::XFERCOMPL) {
        ctx.retry.error_count = 0;
        ChanEvents::CPLT
    } else if hcint.contains(HcInt::STALL) {
        stall()
    } else if hcint.contains(HcInt::BBLERR) {
        fail()
    } else if hcint.contains(HcInt::XACTERR) {
        count_error(ctx, ASYNC_IN_ERROR_LIMIT, ChanEvents::DO_REINIT)
    } else if hcint.intersects(HcInt::NAK | HcInt::ACK | HcInt::DTGERR) {
        ctx.retry.error_count = 0;
        ChanEvents::DO_REINIT
    } else {
        ChanEvents::empty()
    }
}

fn async_out(_dir: UsbDirection, hcint: HcInt, ctx: &mut DecodeCtx) -> ChanEvents {
    let rewind = ChanEvents::DO_REWIND_BUFFER | ChanEvents::DO_REINIT;
    if hcint.contains(HcInt::XFERCOMPL) {
        ctx.retry.error_count = 1;
        ChanEvents::CPLT
    } else if hcint.contains(HcInt::STALL) {
        stall()
    } else if hcint.contains(HcInt::XACTERR) {
        if hcint.intersects(HcInt::NAK | HcInt::NYET | HcInt::ACK) {
            // The retried transaction got through to the device
            ctx.retry.error_count = 1;
            rewind
        } else {
            count_error(ctx, ERROR_LIMIT, rewind)
        }
    } else if hcint.intersects(HcInt::NAK | HcInt::NYET) {
        ctx.retry.error_count = 1;
        rewind
    } else if hcint.intersects(HcInt::ACK | HcInt::DTGERR) {
        ctx.retry.error_count = 1;
        ChanEvents::DO_REINIT
    } else {
        ChanEvents::empty()
    }
}

fn split_async(dir: UsbDirection, hcint: HcInt, ctx: &mut DecodeCtx) -> ChanEvents {
    if !ctx.retry.do_csplit {
        if hcint.contains(HcInt::ACK) {
            ctx.retry.error_count = 0;
            ctx.retry.do_csplit = true;
            ChanEvents::DO_REENABLE_CHANNEL
        } else if hcint.contains(HcInt::NAK) {
            ctx.retry.error_count = 0;
            ChanEvents::DO_RETRY_SSPLIT
        } else if hcint.contains(HcInt::STALL) {
            stall()
        } else if hcint.contains(HcInt::XACTERR) {
            count_error(ctx, ERROR_LIMIT, ChanEvents::DO_RETRY_SSPLIT)
        } else {
            ChanEvents::empty()
        }
    } else if hcint.contains(HcInt::XFERCOMPL)
        || (dir == UsbDirection::Out && hcint.contains(HcInt::ACK))
    {
        ctx.retry = RetryState::default();
        ChanEvents::CPLT
    } else if hcint.contains(HcInt::NYET) {
        ChanEvents::DO_RETRY_CSPLIT
    } else if hcint.contains(HcInt::NAK) {
        ctx.retry.do_csplit = false;
        ChanEvents::DO_RETRY_SSPLIT
    } else if hcint.contains(HcInt::STALL) {
        ctx.retry.do_csplit = false;
        stall()
    } else if hcint.contains(HcInt::XACTERR) {
        count_error(ctx, ERROR_LIMIT, ChanEvents::DO_RETRY_CSPLIT)
    } else if hcint.contains(HcInt::DTGERR) {
        ctx.retry.do_csplit = false;
        ChanEvents::DO_RETRY_SSPLIT
    } else {
        ChanEvents::empty()
    }
}

// ---------------------------------------------------------------------------
// Interrupt
// ---------------------------------------------------------------------------

fn periodic_intr(dir: UsbDirection, hcint: HcInt, ctx: &mut DecodeCtx) -> ChanEvents {
    if hcint.contains(HcInt::XFERCOMPL) {
        ctx.retry.error_count = 0;
        completed(ctx, ChanEvents::DO_REINIT)
    } else if hcint.contains(HcInt::STALL) {
        stall()
    } else if hcint.contains(HcInt::BBLERR) {
        fail()
    } else if hcint.contains(HcInt::XACTERR) {
        count_error(ctx, ERROR_LIMIT, ChanEvents::DO_REINIT)
    } else if hcint.contains(HcInt::NAK) {
        ctx.retry.error_count = 0;
        if dir == UsbDirection::Out {
            ChanEvents::DO_REWIND_BUFFER | ChanEvents::DO_REINIT
        } else {
            ChanEvents::DO_REINIT
        }
    } else if hcint.contains(HcInt::FRMOVRUN) {
        ChanEvents::DO_REINIT
    } else if hcint.intersects(HcInt::ACK | HcInt::DTGERR) {
        ctx.retry.error_count = 0;
        ChanEvents::DO_REINIT
    } else {
        ChanEvents::empty()
    }
}

fn split_intr(dir: UsbDirection, hcint: HcInt, ctx: &mut DecodeCtx) -> ChanEvents {
    if !ctx.retry.do_csplit {
        if hcint.contains(HcInt::ACK) {
            ctx.retry.error_count = 0;
            ctx.retry.do_csplit = true;
            ChanEvents::DO_REENABLE_CHANNEL
        } else if hcint.contains(HcInt::STALL) {
            stall()
        } else if hcint.contains(HcInt::XACTERR) {
            count_error(ctx, ERROR_LIMIT, ChanEvents::DO_RETRY_SSPLIT)
        } else if hcint.intersects(HcInt::NAK | HcInt::FRMOVRUN) {
            ChanEvents::DO_RETRY_SSPLIT
        } else {
            ChanEvents::empty()
        }
    } else if hcint.contains(HcInt::XFERCOMPL)
        || (dir == UsbDirection::Out && hcint.contains(HcInt::ACK))
    {
        ctx.retry = RetryState::default();
        completed(ctx, ChanEvents::DO_REINIT)
    } else if hcint.contains(HcInt::NYET) {
        ChanEvents::DO_RETRY_CSPLIT
    } else if hcint.contains(HcInt::NAK) {
        // Nothing to report this interval, poll again
        ctx.retry.do_csplit = false;
        ChanEvents::DO_REINIT
    } else if hcint.contains(HcInt::STALL) {
        ctx.retry.do_csplit = false;
        stall()
    } else if hcint.contains(HcInt::XACTERR) {
        count_error(ctx, ERROR_LIMIT, ChanEvents::DO_RETRY_CSPLIT)
    } else if hcint.intersects(HcInt::FRMOVRUN | HcInt::DTGERR) {
        ctx.retry.do_csplit = false;
        ChanEvents::DO_RETRY_SSPLIT
    } else {
        ChanEvents::empty()
    }
}

// ---------------------------------------------------------------------------
// Isochronous
// ---------------------------------------------------------------------------

/// Isochronous delivery is not guaranteed: a lost packet still completes.
fn periodic_isoc(_dir: UsbDirection, hcint: HcInt, _ctx: &mut DecodeCtx) -> ChanEvents {
    if hcint.contains(HcInt::BBLERR) {
        fail()
    } else if hcint.intersects(HcInt::XFERCOMPL | HcInt::XACTERR | HcInt::FRMOVRUN) {
        ChanEvents::CPLT
    } else {
        ChanEvents::empty()
    }
}

/// Isochronous OUT splits have no complete-split phase.
fn split_isoc_out(_dir: UsbDirection, hcint: HcInt, ctx: &mut DecodeCtx) -> ChanEvents {
    if hcint.intersects(HcInt::ACK | HcInt::XFERCOMPL) {
        ctx.retry.error_count = 0;
        completed(ctx, ChanEvents::DO_NEXT_SSPLIT)
    } else if hcint.contains(HcInt::XACTERR) {
        count_error(ctx, ERROR_LIMIT, ChanEvents::DO_RETRY_SSPLIT)
    } else if hcint.contains(HcInt::FRMOVRUN) {
        ChanEvents::DO_RETRY_SSPLIT
    } else {
        ChanEvents::empty()
    }
}

fn split_isoc_in(_dir: UsbDirection, hcint: HcInt, ctx: &mut DecodeCtx) -> ChanEvents {
    if !ctx.retry.do_csplit {
        if hcint.contains(HcInt::ACK) {
            ctx.retry.error_count = 0;
            ctx.retry.do_csplit = true;
            ChanEvents::DO_NEXT_CSPLIT
        } else if hcint.contains(HcInt::XACTERR) {
            count_error(ctx, ERROR_LIMIT, ChanEvents::DO_RETRY_SSPLIT)
        } else if hcint.contains(HcInt::FRMOVRUN) {
            ChanEvents::DO_RETRY_SSPLIT
        } else {
            ChanEvents::empty()
        }
    } else if hcint.contains(HcInt::XFERCOMPL) {
        ctx.retry = RetryState::default();
        completed(ctx, ChanEvents::DO_NEXT_SSPLIT)
    } else if hcint.contains(HcInt::NYET) {
        ChanEvents::DO_NEXT_CSPLIT
    } else if hcint.contains(HcInt::XACTERR) {
        count_error(ctx, ERROR_LIMIT, ChanEvents::DO_RETRY_CSPLIT)
    } else if hcint.contains(HcInt::FRMOVRUN) {
        ctx.retry.do_csplit = false;
        ChanEvents::DO_RETRY_SSPLIT
    } else {
        ChanEvents::empty()
    }
}
