//! Source fed by application code.
//!
//! Other threads push frames through an [`AppSourceHandle`]. Each push is
//! queued on a bounded channel and signalled on an eventfd, which the chain
//! polls like any other descriptor-driven source.

use crate::buffer::FrameBuffer;
use crate::clock;
use crate::driver::{Description, DriverBackend, DriverCore};
use crate::error::{Error, Result};
use crate::fd::EventFd;
use crate::format::{Format, FormatCatalog};
use crate::observability;
use crate::unit::{FrameOutput, UnitFlags, UnitKind};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Frames the queue holds before pushes start being dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Descriptor-driven source that emits frames pushed by the application.
///
/// The source has no formats of its own: give it some with
/// [`with_format`](Self::with_format) or
/// [`Unit::add_output_format`](crate::unit::Unit::add_output_format).
///
/// # Example
///
/// ```rust,ignore
/// use camchain::units::AppSource;
///
/// let source = AppSource::new()?.with_format(Format::packed(PixelFormat::Gray8, 4, 4));
/// let handle = source.handle();
///
/// // In another thread:
/// handle.push(FrameBuffer::new(vec![0u8; 16]))?;
/// ```
pub struct AppSource {
    efd: Arc<EventFd>,
    tx: kanal::Sender<FrameBuffer>,
    rx: kanal::Receiver<FrameBuffer>,
    formats: Vec<Format>,
    sequence: u64,
}

impl AppSource {
    /// Source with the default queue capacity.
    pub fn new() -> Result<Self> {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Source holding at most `capacity` undelivered frames.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let (tx, rx) = kanal::bounded(capacity.max(1));
        Ok(Self {
            efd: Arc::new(EventFd::new()?),
            tx,
            rx,
            formats: Vec::new(),
            sequence: 0,
        })
    }

    /// Advertise a format.
    pub fn with_format(mut self, format: Format) -> Self {
        self.formats.push(format);
        self
    }

    /// Handle for pushing frames from any thread.
    pub fn handle(&self) -> AppSourceHandle {
        AppSourceHandle {
            tx: self.tx.clone(),
            efd: self.efd.clone(),
        }
    }

    /// Frames waiting to be emitted.
    pub fn queue_len(&self) -> usize {
        self.rx.len()
    }

    fn flush(&mut self) -> Result<()> {
        let mut dropped = 0;
        while let Ok(Some(_)) = self.rx.try_recv() {
            dropped += 1;
        }
        self.efd.try_wait()?;
        if dropped > 0 {
            debug!(dropped, "app source flushed undelivered frames");
        }
        Ok(())
    }
}

impl UnitKind for AppSource {
    fn derive_outputs(&mut self, catalog: &mut FormatCatalog, _input: Option<&Format>) {
        for format in &self.formats {
            catalog.insert(format.clone());
        }
    }

    fn stream_on(&mut self) -> Result<()> {
        self.sequence = 0;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.flush()
    }

    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        Some(self.efd.as_fd())
    }

    fn try_produce(&mut self, out: &mut FrameOutput) -> Result<bool> {
        self.efd.try_wait()?;
        let mut produced = false;
        while let Ok(Some(mut frame)) = self.rx.try_recv() {
            if frame.timestamp == 0 {
                frame.timestamp = clock::now_micros();
            }
            frame.sequence = self.sequence;
            self.sequence += 1;
            trace!(sequence = frame.sequence, size = frame.bytes_used(), "app source frame");
            out.push(frame);
            produced = true;
        }
        Ok(produced)
    }
}

/// Cloneable, thread-safe producer side of an [`AppSource`].
#[derive(Clone)]
pub struct AppSourceHandle {
    tx: kanal::Sender<FrameBuffer>,
    efd: Arc<EventFd>,
}

impl AppSourceHandle {
    /// Queue a frame and wake the chain.
    ///
    /// Never blocks. Returns `Ok(false)` if the queue was full and the frame
    /// was dropped; fails once the source is gone.
    pub fn push(&self, frame: FrameBuffer) -> Result<bool> {
        match self.tx.try_send(frame) {
            Ok(true) => {
                self.efd.notify()?;
                Ok(true)
            }
            Ok(false) => {
                warn!("app source queue full, dropping frame");
                observability::record_frame_dropped(APP_SOURCE_ID);
                Ok(false)
            }
            Err(_) => Err(Error::hook("app source is closed")),
        }
    }

    /// Returns true once the source has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_disconnected()
    }
}

const APP_SOURCE_ID: &str = "input.app";

/// Backend of the `input.app` driver.
///
/// Creating the eventfd can fail, so this driver cannot use a stock
/// constructor.
pub(crate) struct AppSourceBackend;

impl DriverBackend for AppSourceBackend {
    fn start(&mut self, core: &mut DriverCore) -> Result<()> {
        core.add_description("Application source", None, UnitFlags::DESCRIPTOR_EVENT)?;
        Ok(())
    }

    fn create_unit(&mut self, _description: &Description) -> Result<Box<dyn UnitKind>> {
        Ok(Box::new(AppSource::new()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;
    use crate::unit::{Unit, UnitStatus};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    fn gray() -> Format {
        Format::packed(PixelFormat::Gray8, 2, 2)
    }

    fn unit(source: AppSource) -> Unit {
        Unit::new(APP_SOURCE_ID, "Application source", UnitFlags::DESCRIPTOR_EVENT, Box::new(source))
    }

    #[test]
    fn test_push_from_thread() {
        let source = AppSource::new().unwrap().with_format(gray());
        let handle = source.handle();
        let mut unit = unit(source);

        let frames = Arc::new(Mutex::new(Vec::new()));
        let f = frames.clone();
        unit.subscribe_frames(Box::new(move |frame: &FrameBuffer, _: &Format| {
            f.lock().unwrap().push(frame.clone());
        }));
        unit.set_status(UnitStatus::Streaming).unwrap();

        let producer = thread::spawn(move || {
            for i in 0..3u8 {
                assert!(handle.push(FrameBuffer::new(vec![i; 4])).unwrap());
            }
        });
        producer.join().unwrap();

        assert!(unit.try_produce(Duration::from_millis(500)).unwrap());
        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].as_bytes(), &[2, 2, 2, 2]);
        assert_eq!(frames[2].sequence, 2);
        assert!(frames.iter().all(|f| f.timestamp > 0));
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let source = AppSource::with_capacity(1).unwrap();
        let handle = source.handle();
        assert!(handle.push(FrameBuffer::new(vec![1u8])).unwrap());
        assert!(!handle.push(FrameBuffer::new(vec![2u8])).unwrap());
        assert_eq!(source.queue_len(), 1);
    }

    #[test]
    fn test_nothing_queued_is_not_ready() {
        let mut unit = unit(AppSource::new().unwrap().with_format(gray()));
        unit.set_status(UnitStatus::Streaming).unwrap();
        assert!(!unit.try_produce(Duration::from_millis(5)).unwrap());
    }

    #[test]
    fn test_stream_off_flushes() {
        let source = AppSource::new().unwrap().with_format(gray());
        let handle = source.handle();
        let mut unit = unit(source);
        unit.set_status(UnitStatus::Streaming).unwrap();
        handle.push(FrameBuffer::new(vec![0u8; 4])).unwrap();

        unit.set_status(UnitStatus::Ready).unwrap();
        assert_eq!(unit.kind_ref::<AppSource>().unwrap().queue_len(), 0);
    }

    #[test]
    fn test_push_after_drop_fails() {
        let source = AppSource::new().unwrap();
        let handle = source.handle();
        drop(source);
        assert!(handle.is_closed());
        assert!(handle.push(FrameBuffer::new(vec![0u8])).is_err());
    }
}
