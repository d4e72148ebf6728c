//! Frame pacing across a fixed number of frames in flight.
//!
//! [`FrameScheduler`] holds only the protocol state (slot index, acquired
//! image, pending resize). Every GPU interaction goes through a
//! [`FrameBackend`], which the renderer implements on top of the real device.

use crate::error::{GpuError, Result};
use crate::swapchain::{AcquireOutcome, PresentOutcome};
use ash::vk;

/// Number of frame slots cycled round-robin.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// What happened during a `begin_frame` or `end_frame` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Proceed normally.
    Ok,
    /// The presentation chain was rebuilt; size-dependent state must follow.
    Recreated,
    /// The chain was rebuilt and no image is available; skip this frame.
    Skipped,
}

impl FrameStatus {
    /// Whether the chain changed during the call.
    pub fn chain_changed(self) -> bool {
        !matches!(self, Self::Ok)
    }
}

/// GPU operations the scheduler drives.
pub trait FrameBackend {
    /// Block until the slot's fence is signaled.
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;

    /// Unsignal the slot's fence and make its command buffer recordable.
    fn reset_slot(&mut self, slot: usize) -> Result<()>;

    /// Acquire a chain image signaling the slot's "image available" semaphore.
    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome>;

    /// Submit `cmd`, waiting on "image available" and signaling
    /// "render finished" plus the slot's fence.
    fn submit(&mut self, slot: usize, cmd: vk::CommandBuffer) -> Result<()>;

    /// Present `image_index` once the slot's "render finished" signals.
    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;

    /// Block until the device is idle.
    fn wait_idle(&mut self) -> Result<()>;

    /// Rebuild the presentation chain and everything sized after it.
    fn recreate_chain(&mut self) -> Result<()>;
}

/// Acquire, submit and present protocol state.
#[derive(Debug, Default)]
pub struct FrameScheduler {
    slot: usize,
    frame_count: u64,
    image_index: Option<u32>,
    resize_requested: bool,
    recreations: u64,
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a frame.
    ///
    /// Waits on the current slot's fence. If the chain turns out to be out of
    /// date it is rebuilt and [`FrameStatus::Skipped`] is returned with the
    /// fence left signaled, so the slot can be waited on again.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn begin_frame<B: FrameBackend + ?Sized>(&mut self, backend: &mut B) -> Result<FrameStatus> {
        if self.image_index.is_some() {
            return Err(GpuError::InvalidState(
                "begin_frame called twice without end_frame".to_string(),
            ));
        }

        backend.wait_for_slot(self.slot)?;

        let mut status = FrameStatus::Ok;
        if self.resize_requested {
            self.recreate(backend)?;
            status = FrameStatus::Recreated;
        }

        match backend.acquire_image(self.slot)? {
            AcquireOutcome::OutOfDate => {
                tracing::debug!("Chain out of date on acquire, skipping frame");
                self.recreate(backend)?;
                return Ok(FrameStatus::Skipped);
            }
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    tracing::trace!("Acquired image {image_index} is suboptimal");
                }
                self.image_index = Some(image_index);
            }
        }

        backend.reset_slot(self.slot)?;
        Ok(status)
    }

    /// Submit `cmd`, present, advance to the next slot and wait for the
    /// device to go idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn end_frame<B: FrameBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        cmd: vk::CommandBuffer,
    ) -> Result<FrameStatus> {
        let image_index = self.image_index.take().ok_or_else(|| {
            GpuError::InvalidState("end_frame called without a successful begin_frame".to_string())
        })?;

        backend.submit(self.slot, cmd)?;
        let outcome = backend.present(self.slot, image_index)?;

        let mut status = FrameStatus::Ok;
        if outcome == PresentOutcome::Stale || self.resize_requested {
            self.recreate(backend)?;
            status = FrameStatus::Recreated;
        }

        self.slot = (self.slot + 1) % MAX_FRAMES_IN_FLIGHT;
        self.frame_count += 1;

        // Keeps every resource referenced by this frame free for reuse on return.
        backend.wait_idle()?;

        Ok(status)
    }

    fn recreate<B: FrameBackend + ?Sized>(&mut self, backend: &mut B) -> Result<()> {
        self.resize_requested = false;
        backend.recreate_chain()?;
        self.recreations += 1;
        Ok(())
    }

    /// Rebuild the chain at the next opportunity.
    pub fn request_resize(&mut self) {
        self.resize_requested = true;
    }

    pub fn resize_requested(&self) -> bool {
        self.resize_requested
    }

    /// Current frame slot, in `0..MAX_FRAMES_IN_FLIGHT`.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Image acquired by the frame in progress.
    pub fn image_index(&self) -> Option<u32> {
        self.image_index
    }

    /// Whether a frame has begun and not yet ended.
    pub fn in_frame(&self) -> bool {
        self.image_index.is_some()
    }

    /// Number of completed frames.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Number of chain rebuilds performed.
    pub fn recreations(&self) -> u64 {
        self.recreations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Wait { slot: usize, blocked_on: Option<u64> },
        Reset(usize),
        Acquire(usize),
        Submit { slot: usize, frame: u64 },
        Present(usize, u32),
        WaitIdle,
        Recreate,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Fence {
        Signaled,
        Unsignaled,
        /// Submitted work for the given frame that the GPU has not finished.
        Pending(u64),
    }

    /// Simulated GPU. Submitted work only completes when something waits
    /// for it, so every blocking wait shows up in the event log.
    struct SimulatedGpu {
        fences: [Fence; MAX_FRAMES_IN_FLIGHT],
        events: Vec<Event>,
        acquires: VecDeque<AcquireOutcome>,
        presents: VecDeque<PresentOutcome>,
        idle_drains: bool,
        next_image: u32,
        submitted: u64,
    }

    impl SimulatedGpu {
        fn new() -> Self {
            Self {
                fences: [Fence::Signaled; MAX_FRAMES_IN_FLIGHT],
                events: Vec::new(),
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
                idle_drains: true,
                next_image: 0,
                submitted: 0,
            }
        }

        /// Leave submitted work running across `wait_idle` to model GPU lag.
        fn lagging() -> Self {
            Self {
                idle_drains: false,
                ..Self::new()
            }
        }

        fn count(&self, event: &Event) -> usize {
            self.events.iter().filter(|e| *e == event).count()
        }
    }

    impl FrameBackend for SimulatedGpu {
        fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
            let blocked_on = match self.fences[slot] {
                Fence::Pending(frame) => Some(frame),
                Fence::Signaled => None,
                Fence::Unsignaled => panic!("waiting on slot {slot} that was never submitted"),
            };
            self.fences[slot] = Fence::Signaled;
            self.events.push(Event::Wait { slot, blocked_on });
            Ok(())
        }

        fn reset_slot(&mut self, slot: usize) -> Result<()> {
            assert_eq!(
                self.fences[slot],
                Fence::Signaled,
                "slot {slot} reset before its fence signaled"
            );
            self.fences[slot] = Fence::Unsignaled;
            self.events.push(Event::Reset(slot));
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
            self.events.push(Event::Acquire(slot));
            Ok(self.acquires.pop_front().unwrap_or_else(|| {
                let image_index = self.next_image;
                self.next_image = (self.next_image + 1) % 3;
                AcquireOutcome::Acquired {
                    image_index,
                    suboptimal: false,
                }
            }))
        }

        fn submit(&mut self, slot: usize, _cmd: vk::CommandBuffer) -> Result<()> {
            assert_eq!(
                self.fences[slot],
                Fence::Unsignaled,
                "slot {slot} submitted without a reset fence"
            );
            self.submitted += 1;
            self.fences[slot] = Fence::Pending(self.submitted);
            self.events.push(Event::Submit {
                slot,
                frame: self.submitted,
            });
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
            self.events.push(Event::Present(slot, image_index));
            Ok(self
                .presents
                .pop_front()
                .unwrap_or(PresentOutcome::Presented))
        }

        fn wait_idle(&mut self) -> Result<()> {
            if self.idle_drains {
                for fence in &mut self.fences {
                    if matches!(fence, Fence::Pending(_)) {
                        *fence = Fence::Signaled;
                    }
                }
            }
            self.events.push(Event::WaitIdle);
            Ok(())
        }

        fn recreate_chain(&mut self) -> Result<()> {
            self.events.push(Event::Recreate);
            Ok(())
        }
    }

    fn run_frame(scheduler: &mut FrameScheduler, gpu: &mut SimulatedGpu) -> FrameStatus {
        match scheduler.begin_frame(gpu).unwrap() {
            FrameStatus::Skipped => FrameStatus::Skipped,
            begin => {
                let end = scheduler
                    .end_frame(gpu, vk::CommandBuffer::from_raw(1))
                    .unwrap();
                if begin == FrameStatus::Recreated {
                    begin
                } else {
                    end
                }
            }
        }
    }

    #[test]
    fn slots_cycle_round_robin() {
        let mut scheduler = FrameScheduler::new();
        let mut gpu = SimulatedGpu::new();
        let mut visited = Vec::new();
        for _ in 0..7 {
            visited.push(scheduler.slot());
            assert_eq!(run_frame(&mut scheduler, &mut gpu), FrameStatus::Ok);
        }
        assert_eq!(visited, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(scheduler.frame_count(), 7);
    }

    #[test]
    fn fourth_frame_waits_for_first_frames_fence() {
        let mut scheduler = FrameScheduler::new();
        let mut gpu = SimulatedGpu::lagging();
        for _ in 0..5 {
            run_frame(&mut scheduler, &mut gpu);
        }

        let waits: Vec<_> = gpu
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Wait { slot, blocked_on } => Some((*slot, *blocked_on)),
                _ => None,
            })
            .collect();
        assert_eq!(
            waits,
            vec![
                (0, None),
                (1, None),
                (2, None),
                (0, Some(1)),
                (1, Some(2)),
            ]
        );
    }

    #[test]
    fn slot_is_never_reset_before_its_fence_signals() {
        // `SimulatedGpu::reset_slot` panics on a violation; run long enough
        // to wrap the ring many times, with stale chains mixed in.
        let mut scheduler = FrameScheduler::new();
        let mut gpu = SimulatedGpu::lagging();
        for i in 0..50 {
            if i % 7 == 3 {
                gpu.acquires.push_back(AcquireOutcome::OutOfDate);
            }
            if i % 11 == 5 {
                gpu.presents.push_back(PresentOutcome::Stale);
            }
            run_frame(&mut scheduler, &mut gpu);
        }
        assert!(scheduler.frame_count() > 0);
    }

    #[test]
    fn every_frame_ends_with_device_idle() {
        let mut scheduler = FrameScheduler::new();
        let mut gpu = SimulatedGpu::new();
        for _ in 0..4 {
            run_frame(&mut scheduler, &mut gpu);
            assert_eq!(gpu.events.last(), Some(&Event::WaitIdle));
        }
        assert_eq!(gpu.count(&Event::WaitIdle), 4);
    }

    #[test]
    fn out_of_date_acquire_skips_without_reset() {
        let mut scheduler = FrameScheduler::new();
        let mut gpu = SimulatedGpu::new();
        gpu.acquires.push_back(AcquireOutcome::OutOfDate);

        assert_eq!(scheduler.begin_frame(&mut gpu).unwrap(), FrameStatus::Skipped);
        assert_eq!(
            gpu.events,
            vec![
                Event::Wait {
                    slot: 0,
                    blocked_on: None
                },
                Event::Acquire(0),
                Event::Recreate,
            ]
        );
        assert_eq!(gpu.fences[0], Fence::Signaled);
        assert!(!scheduler.in_frame());
        assert_eq!(scheduler.slot(), 0);
        assert_eq!(scheduler.recreations(), 1);

        // The retried frame waits on the same, still signaled, slot.
        assert_eq!(run_frame(&mut scheduler, &mut gpu), FrameStatus::Ok);
        assert_eq!(gpu.count(&Event::Reset(0)), 1);
    }

    #[test]
    fn stale_present_recreates_after_presenting() {
        let mut scheduler = FrameScheduler::new();
        let mut gpu = SimulatedGpu::new();
        gpu.presents.push_back(PresentOutcome::Stale);

        assert_eq!(run_frame(&mut scheduler, &mut gpu), FrameStatus::Recreated);
        let tail: Vec<_> = gpu.events.iter().rev().take(3).cloned().collect();
        assert_eq!(tail, vec![Event::WaitIdle, Event::Recreate, Event::Present(0, 0)]);
        assert_eq!(scheduler.slot(), 1);
    }

    #[test]
    fn resize_request_rebuilds_exactly_once() {
        let mut scheduler = FrameScheduler::new();
        let mut gpu = SimulatedGpu::new();
        run_frame(&mut scheduler, &mut gpu);

        scheduler.request_resize();
        assert!(scheduler.resize_requested());
        assert_eq!(run_frame(&mut scheduler, &mut gpu), FrameStatus::Recreated);
        assert_eq!(run_frame(&mut scheduler, &mut gpu), FrameStatus::Ok);

        assert_eq!(gpu.count(&Event::Recreate), 1);
        assert!(!scheduler.resize_requested());
    }

    #[test]
    fn end_without_begin_is_rejected() {
        let mut scheduler = FrameScheduler::new();
        let mut gpu = SimulatedGpu::new();
        assert!(matches!(
            scheduler.end_frame(&mut gpu, vk::CommandBuffer::null()),
            Err(GpuError::InvalidState(_))
        ));
        assert!(gpu.events.is_empty());
    }

    #[test]
    fn double_begin_is_rejected() {
        let mut scheduler = FrameScheduler::new();
        let mut gpu = SimulatedGpu::new();
        scheduler.begin_frame(&mut gpu).unwrap();
        assert!(matches!(
            scheduler.begin_frame(&mut gpu),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn status_reports_chain_changes() {
        assert!(!FrameStatus::Ok.chain_changed());
        assert!(FrameStatus::Recreated.chain_changed());
        assert!(FrameStatus::Skipped.chain_changed());
    }
}
