//! Deferred work submission.

/// Work-queue hooks a device controller uses to defer processing.
///
/// The driver only *requests* work; the embedding kernel is expected to call
/// the matching driver entry point from thread context:
///
/// - [`WorkScheduler::submit_ep_work`] → `Dwc3Device::ep_work(ep)`
/// - [`WorkScheduler::schedule_event_work`] → `Dwc3Device::event_work()`
pub trait WorkScheduler: Send + Sync {
    /// Queue the per-endpoint work item for endpoint address `ep`.
    fn submit_ep_work(&self, ep: u8);

    /// (Re)schedule the event worker after `delay_ms`; zero means now.
    fn schedule_event_work(&self, delay_ms: u32);
}
