//! The chain's event loop.
//!
//! One wakeup merges every Streaming source unit with the manager's driver
//! notification descriptors:
//!
//! - timer-driven units contribute their next event time; the earliest one
//!   bounds the wait (zero if already due),
//! - descriptor-driven units and driver notifications are polled.
//!
//! Ready units are dispatched in chain order. By default only the first is
//! dispatched per wakeup; [`ChainConfig::drain_all_ready`](super::ChainConfig)
//! dispatches all of them.

use super::Chain;
use crate::clock;
use crate::driver::DriverId;
use crate::error::Result;
use crate::manager;
use crate::observability;
use crate::unit::UnitFlags;
use rustix::event::{PollFd, PollFlags, poll};
use rustix::io::Errno;
use smallvec::SmallVec;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{trace, warn};

/// Upper bound on one wait inside [`Chain::run`], so the stop flag is seen.
const RUN_WAKEUP: Duration = Duration::from_millis(50);

/// What one wakeup found ready.
#[derive(Default)]
struct Readiness {
    units: SmallVec<[usize; 8]>,
    drivers: SmallVec<[DriverId; 4]>,
}

impl Chain {
    /// Wait for the next event and dispatch.
    ///
    /// Waits at most `timeout` (`None` waits until something is ready; with
    /// nothing to wait on it returns immediately). Returns the number of
    /// units dispatched.
    pub fn iterate(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let span = self.config.tracing.chain_span(&self.name);
        let _guard = span.enter();

        self.process_status_changes();
        self.run_recovery();

        let watches = match &self.manager {
            Some(handle) => manager::lock(handle).notification_fds(),
            None => Vec::new(),
        };
        let ready = self.wait_ready(timeout, &watches)?;

        for id in &ready.drivers {
            if let Some(handle) = &self.manager {
                if let Err(e) = manager::lock(handle).update_driver(*id) {
                    warn!(chain = %self.name, driver = %id, error = %e, "driver update failed");
                }
            }
        }

        let mut dispatched = 0;
        for &index in &ready.units {
            // An earlier dispatch may have restarted this unit.
            if index >= self.units.len() || !self.units[index].is_streaming() {
                continue;
            }
            trace!(chain = %self.name, unit = %self.units[index].id(), "dispatch");
            self.dispatch(index);
            observability::record_dispatch(&self.name);
            dispatched += 1;
            self.process_status_changes();
            if !self.config.drain_all_ready {
                break;
            }
        }

        self.run_recovery();
        Ok(dispatched)
    }

    /// Run [`iterate`](Self::iterate) until `stop` is set.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        while !stop.load(Ordering::Acquire) {
            self.iterate(Some(RUN_WAKEUP))?;
        }
        Ok(())
    }

    fn wait_ready(
        &self,
        timeout: Option<Duration>,
        watches: &[(DriverId, Arc<OwnedFd>)],
    ) -> Result<Readiness> {
        let mut ready = Readiness::default();
        let now = clock::now_micros();

        let mut timers: SmallVec<[(usize, i64); 8]> = SmallVec::new();
        let mut polled: SmallVec<[usize; 8]> = SmallVec::new();
        let mut fds: Vec<PollFd<'_>> = Vec::new();
        let mut wait = timeout.map(|t| t.as_micros().min(i64::MAX as u128) as i64);

        for (index, unit) in self.units.iter().enumerate() {
            if !unit.is_streaming() {
                continue;
            }
            if unit.flags().contains(UnitFlags::TIMER_EVENT) {
                if let Some(deadline) = unit.next_event_time() {
                    let remaining = (deadline - now).max(0);
                    wait = Some(wait.map_or(remaining, |w| w.min(remaining)));
                    timers.push((index, deadline));
                }
            }
            if let Some(fd) = unit.descriptor() {
                polled.push(index);
                fds.push(PollFd::from_borrowed_fd(fd, PollFlags::IN));
            }
        }
        for (_, fd) in watches {
            fds.push(PollFd::new(fd, PollFlags::IN));
        }

        let wait = wait.map(clock::micros_to_duration);
        if fds.is_empty() {
            match wait {
                Some(d) if !d.is_zero() => std::thread::sleep(d),
                _ => {}
            }
        } else {
            let timespec = wait.map(clock::to_timespec);
            loop {
                match poll(&mut fds, timespec.as_ref()) {
                    Ok(_) => break,
                    Err(Errno::INTR) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let fired = |fd: &PollFd<'_>| {
            fd.revents()
                .intersects(PollFlags::IN | PollFlags::HUP | PollFlags::ERR)
        };
        let now = clock::now_micros();

        let (unit_fds, watch_fds) = fds.split_at(polled.len());
        for (index, fd) in polled.iter().zip(unit_fds) {
            if fired(fd) {
                ready.units.push(*index);
            }
        }
        for ((id, _), fd) in watches.iter().zip(watch_fds) {
            if fired(fd) {
                ready.drivers.push(*id);
            }
        }
        for (index, deadline) in timers {
            if deadline <= now && !ready.units.contains(&index) {
                ready.units.push(index);
            }
        }
        ready.units.sort_unstable();
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FrameBuffer;
    use crate::chain::{ChainConfig, ChainEvent};
    use crate::error::Error;
    use crate::fd::EventFd;
    use crate::format::{Format, FormatCatalog, PixelFormat};
    use crate::unit::{FrameOutput, Unit, UnitKind, UnitStatus};
    use std::os::fd::{AsFd, BorrowedFd};
    use std::sync::Mutex;

    fn one_format(catalog: &mut FormatCatalog) {
        catalog.clear();
        catalog.insert(Format::packed(PixelFormat::Gray8, 4, 1));
    }

    struct Due {
        next: Option<i64>,
        fail: bool,
    }

    impl UnitKind for Due {
        fn derive_outputs(&mut self, catalog: &mut FormatCatalog, _input: Option<&Format>) {
            one_format(catalog);
        }

        fn next_event_time(&self) -> Option<i64> {
            self.next
        }

        fn try_produce(&mut self, out: &mut FrameOutput) -> crate::Result<bool> {
            if self.fail {
                return Err(Error::hook("device lost"));
            }
            out.push(FrameBuffer::new(vec![7u8; 4]).with_timestamp(clock::now_micros()));
            self.next = self.next.map(|t| t + 1_000_000);
            Ok(true)
        }
    }

    struct Signalled {
        efd: EventFd,
    }

    impl UnitKind for Signalled {
        fn derive_outputs(&mut self, catalog: &mut FormatCatalog, _input: Option<&Format>) {
            one_format(catalog);
        }

        fn descriptor(&self) -> Option<BorrowedFd<'_>> {
            Some(self.efd.as_fd())
        }

        fn try_produce(&mut self, out: &mut FrameOutput) -> crate::Result<bool> {
            let n = self.efd.try_wait()?;
            for _ in 0..n {
                out.push(FrameBuffer::new(vec![1u8; 4]).with_timestamp(clock::now_micros()));
            }
            Ok(n > 0)
        }
    }

    fn due(id: &str, next: Option<i64>) -> Unit {
        Unit::new(id, id, UnitFlags::TIMER_EVENT, Box::new(Due { next, fail: false }))
    }

    fn count_frames(chain: &mut Chain) -> Arc<Mutex<usize>> {
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        chain.subscribe_frames(Box::new(move |_: &FrameBuffer, _: &Format| {
            *c.lock().unwrap() += 1;
        }));
        count
    }

    #[test]
    fn test_due_timer_dispatched() {
        let mut chain = Chain::new();
        chain.insert_tail(due("t", Some(0))).unwrap();
        chain.set_desired_status(UnitStatus::Streaming).unwrap();
        let frames = count_frames(&mut chain);

        assert_eq!(chain.iterate(Some(Duration::ZERO)).unwrap(), 1);
        assert_eq!(*frames.lock().unwrap(), 1);
    }

    #[test]
    fn test_unscheduled_timer_ignored() {
        let mut chain = Chain::new();
        chain.insert_tail(due("t", None)).unwrap();
        chain.set_desired_status(UnitStatus::Streaming).unwrap();
        assert_eq!(chain.iterate(Some(Duration::from_millis(1))).unwrap(), 0);
    }

    #[test]
    fn test_single_dispatch_per_wakeup() {
        let mut chain = Chain::new();
        let first = chain.insert(due("a", Some(0)), 0).unwrap();
        chain.insert(due("b", Some(0)), 0).unwrap();
        chain.set_desired_status(UnitStatus::Streaming).unwrap();

        assert_eq!(chain.iterate(Some(Duration::ZERO)).unwrap(), 1);
        // "b" is first in chain order, so "a" is still due.
        let a = chain.unit(first).unwrap();
        assert!(a.next_event_time().unwrap() <= clock::now_micros());
    }

    #[test]
    fn test_drain_all_ready() {
        let mut chain = Chain::with_config(ChainConfig::default().with_drain_all_ready(true));
        chain.insert_tail(due("a", Some(0))).unwrap();
        chain.insert_tail(due("b", Some(0))).unwrap();
        chain.set_desired_status(UnitStatus::Streaming).unwrap();
        assert_eq!(chain.iterate(Some(Duration::ZERO)).unwrap(), 2);
    }

    #[test]
    fn test_descriptor_source() {
        let mut chain = Chain::new();
        let efd = EventFd::new().unwrap();
        efd.notify().unwrap();
        let unit = Unit::new(
            "sig",
            "sig",
            UnitFlags::DESCRIPTOR_EVENT,
            Box::new(Signalled { efd }),
        );
        chain.insert_tail(unit).unwrap();
        chain.set_desired_status(UnitStatus::Streaming).unwrap();
        let frames = count_frames(&mut chain);

        assert_eq!(chain.iterate(Some(Duration::from_millis(100))).unwrap(), 1);
        assert_eq!(*frames.lock().unwrap(), 1);
        assert_eq!(chain.iterate(Some(Duration::from_millis(1))).unwrap(), 0);
    }

    #[test]
    fn test_failing_source_is_restarted() {
        let mut chain = Chain::new();
        let handle = chain
            .insert_tail(Unit::new(
                "bad",
                "bad",
                UnitFlags::TIMER_EVENT,
                Box::new(Due { next: Some(0), fail: true }),
            ))
            .unwrap();
        chain.set_desired_status(UnitStatus::Streaming).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        chain.subscribe(Box::new(move |event: &ChainEvent| {
            if let ChainEvent::UnitStatusChanged(c) = event {
                l.lock().unwrap().push(c.to);
            }
        }));

        chain.iterate(Some(Duration::ZERO)).unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                UnitStatus::Ready,
                UnitStatus::Idle,
                UnitStatus::Ready,
                UnitStatus::Streaming
            ]
        );
        assert!(chain.unit(handle).unwrap().is_streaming());
    }

    #[test]
    fn test_run_stops() {
        let mut chain = Chain::new();
        let stop = AtomicBool::new(true);
        chain.run(&stop).unwrap();
    }
}
