//! Sink that writes frames on a background thread.
//!
//! Frames are handed from the chain thread to a writer thread through a
//! bounded queue. A full queue drops the newest frame with a warning; the
//! chain never waits for the writer.

use crate::buffer::FrameBuffer;
use crate::clock;
use crate::error::{Error, Result};
use crate::format::{Format, FormatCatalog};
use crate::observability;
use crate::unit::{Control, ControlValue, FrameOutput, UnitKind};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// Frames the hand-off queue holds by default.
pub const DEFAULT_WRITER_QUEUE: usize = 8;

const WRITER_ID: &str = "output.writer";
const DROP_WARN_INTERVAL_MICROS: i64 = clock::MICROS_PER_SEC;

/// Opens the destination each time the sink is initialised.
pub type TargetFactory = Box<dyn FnMut() -> io::Result<Box<dyn Write + Send>> + Send>;

struct Worker {
    tx: kanal::Sender<FrameBuffer>,
    thread: JoinHandle<io::Result<()>>,
}

/// Sink writing the used bytes of every frame to a file (or any writer).
///
/// With neither a path nor a target the frames are counted and discarded.
///
/// # Example
///
/// ```rust,ignore
/// use camchain::units::Writer;
///
/// let sink = Writer::new().with_path("/tmp/frames.raw").with_queue_capacity(4);
/// ```
pub struct Writer {
    path: Option<PathBuf>,
    target: Option<TargetFactory>,
    capacity: usize,
    worker: Option<Worker>,
    written: Arc<AtomicU64>,
    dropped: u64,
    last_drop_warn: i64,
}

impl Writer {
    /// Discarding sink with the default queue capacity.
    pub fn new() -> Self {
        Self {
            path: None,
            target: None,
            capacity: DEFAULT_WRITER_QUEUE,
            worker: None,
            written: Arc::new(AtomicU64::new(0)),
            dropped: 0,
            last_drop_warn: i64::MIN,
        }
    }

    /// Write to a file, truncated on every stream init.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Write to whatever `factory` opens. Takes precedence over the path.
    pub fn with_target(mut self, factory: TargetFactory) -> Self {
        self.target = Some(factory);
        self
    }

    /// Size of the hand-off queue.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Frames the writer thread has finished writing.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Frames dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Returns true while the writer thread is running.
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    fn open(&mut self) -> io::Result<Box<dyn Write + Send>> {
        if let Some(factory) = self.target.as_mut() {
            return factory();
        }
        match &self.path {
            Some(path) => Ok(Box::new(BufWriter::new(File::create(path)?))),
            None => Ok(Box::new(io::sink())),
        }
    }

    fn spawn(&mut self) -> Result<()> {
        let mut target = self.open()?;
        let (tx, rx) = kanal::bounded::<FrameBuffer>(self.capacity);
        let written = self.written.clone();

        let thread = thread::Builder::new()
            .name("camchain-writer".into())
            .spawn(move || {
                while let Ok(frame) = rx.recv() {
                    target.write_all(&frame.as_bytes()[..frame.bytes_used()])?;
                    written.fetch_add(1, Ordering::Relaxed);
                }
                target.flush()
            })?;
        debug!(capacity = self.capacity, path = ?self.path, "writer thread started");
        self.worker = Some(Worker { tx, thread });
        Ok(())
    }

    /// Close the queue and wait for the thread to write what is left.
    fn join(&mut self) -> Result<()> {
        let Some(Worker { tx, thread }) = self.worker.take() else {
            return Ok(());
        };
        drop(tx);
        match thread.join() {
            Ok(Ok(())) => {
                debug!(written = self.written(), dropped = self.dropped, "writer thread finished");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "writer thread failed");
                Err(e.into())
            }
            Err(_) => Err(Error::hook("writer thread panicked")),
        }
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if let Err(e) = self.join() {
            warn!(error = %e, "writer dropped without a clean shutdown");
        }
    }
}

impl UnitKind for Writer {
    fn derive_outputs(&mut self, catalog: &mut FormatCatalog, input: Option<&Format>) {
        catalog.clear();
        if let Some(format) = input {
            catalog.insert(format.clone());
        }
    }

    fn stream_init(&mut self, _format: &Format) -> Result<()> {
        self.dropped = 0;
        self.spawn()
    }

    fn stream_shutdown(&mut self) -> Result<()> {
        self.join()
    }

    fn on_input_frame(
        &mut self,
        frame: &FrameBuffer,
        _format: &Format,
        _out: &mut FrameOutput,
    ) -> Result<()> {
        let Some(worker) = self.worker.as_ref() else {
            return Err(Error::hook("writer is not initialised"));
        };
        match worker.tx.try_send(frame.clone()) {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.dropped += 1;
                observability::record_frame_dropped(WRITER_ID);
                let now = clock::now_micros();
                if now.saturating_sub(self.last_drop_warn) > DROP_WARN_INTERVAL_MICROS {
                    warn!(dropped = self.dropped, "writer queue full, dropping frame");
                    self.last_drop_warn = now;
                }
                Ok(())
            }
            // the thread exited early; surface its error so the unit is restarted
            Err(_) => match self.join() {
                Ok(()) => Err(Error::hook("writer thread stopped")),
                Err(e) => Err(e),
            },
        }
    }

    fn controls(&self) -> Vec<Control> {
        let path = self
            .path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        vec![Control::string("path", "Output path", &path)]
    }

    fn try_set_control(&mut self, control: &Control, proposed: &ControlValue) -> Option<ControlValue> {
        if control.id() != "path" {
            return None;
        }
        let path = proposed.as_str()?;
        self.path = (!path.is_empty()).then(|| PathBuf::from(path));
        Some(proposed.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;
    use crate::unit::{Unit, UnitFlags, UnitStatus};
    use std::sync::Mutex;

    fn gray() -> Format {
        Format::packed(PixelFormat::Gray8, 2, 2)
    }

    struct Gated {
        gate: kanal::Receiver<()>,
        data: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for Gated {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let _ = self.gate.recv();
            self.data.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("disk gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_discarding_sink() {
        let mut sink = Writer::new();
        let mut out = FrameOutput::new();
        sink.stream_init(&gray()).unwrap();
        assert!(sink.is_running());
        for _ in 0..3 {
            sink.on_input_frame(&FrameBuffer::new(vec![0u8; 4]), &gray(), &mut out).unwrap();
        }
        sink.stream_shutdown().unwrap();
        assert!(!sink.is_running());
        assert_eq!(sink.written() + sink.dropped(), 3);
        assert!(out.is_empty());
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let (open, gate) = kanal::bounded::<()>(0);
        let data = Arc::new(Mutex::new(Vec::new()));
        let d = data.clone();
        let mut gate = Some(gate);
        let mut sink = Writer::new().with_queue_capacity(1).with_target(Box::new(move || -> io::Result<Box<dyn Write + Send>> {
            let gate = gate.take().ok_or_else(|| io::Error::other("opened twice"))?;
            Ok(Box::new(Gated { gate, data: d.clone() }))
        }));

        let mut out = FrameOutput::new();
        sink.stream_init(&gray()).unwrap();
        for i in 0..3u8 {
            let frame = FrameBuffer::new(vec![i; 4]);
            sink.on_input_frame(&frame, &gray(), &mut out).unwrap();
        }
        assert!(sink.dropped() >= 1);

        drop(open);
        sink.stream_shutdown().unwrap();
        assert_eq!(sink.written() + sink.dropped(), 3);
        assert_eq!(data.lock().unwrap().len() as u64, sink.written() * 4);
        // the first frame is never the one dropped
        assert_eq!(&data.lock().unwrap()[..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_writer_error_surfaces() {
        let mut sink = Writer::new()
            .with_target(Box::new(|| -> io::Result<Box<dyn Write + Send>> { Ok(Box::new(Broken)) }));
        let mut out = FrameOutput::new();
        sink.stream_init(&gray()).unwrap();
        sink.on_input_frame(&FrameBuffer::new(vec![1u8; 4]), &gray(), &mut out).unwrap();
        assert!(matches!(sink.stream_shutdown(), Err(Error::Io(_))));
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_drop_logs_writer_failure() {
        let logs = LogBuffer::default();
        let sink_logs = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink_logs.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let mut sink = Writer::new()
                .with_target(Box::new(|| -> io::Result<Box<dyn Write + Send>> { Ok(Box::new(Broken)) }));
            let mut out = FrameOutput::new();
            sink.stream_init(&gray()).unwrap();
            sink.on_input_frame(&FrameBuffer::new(vec![1u8; 4]), &gray(), &mut out).unwrap();
            drop(sink);
        });

        let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(text.contains("WARN"));
        assert!(text.contains("writer dropped without a clean shutdown"));
        assert!(text.contains("disk gone"));
    }

    #[test]
    fn test_writes_file_from_path_control() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.raw");

        let mut unit = Unit::new(WRITER_ID, "Writer", UnitFlags::NONE, Box::new(Writer::new()));
        let value = ControlValue::String(path.to_string_lossy().into_owned());
        unit.set_control("path", value).unwrap();
        unit.add_output_format(PixelFormat::Gray8, None, 2, 2, 2).unwrap();
        unit.set_status(UnitStatus::Streaming).unwrap();

        let mut out = FrameOutput::new();
        let frame = FrameBuffer::new(vec![5u8, 6, 7, 8, 9]).with_bytes_used(4);
        unit.accept_input_frame(&frame, &gray(), &mut out).unwrap();
        unit.set_status(UnitStatus::Idle).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), vec![5, 6, 7, 8]);
    }
}
