#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};

use iesopt::bridge::EngineHandle;
use iesopt::bridge::mock::MockRuntime;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

/// Collects formatted log lines in memory for the current thread.
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

pub struct CaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

impl LogCapture {
    /// Start capturing. Logs are collected until the guard is dropped.
    pub fn install() -> (Self, DefaultGuard) {
        let capture = Self::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }

    /// Number of lines logged at `level` (e.g. `"ERROR"`).
    pub fn count(&self, level: &str) -> usize {
        self.contents()
            .lines()
            .filter(|line| line.trim_start().starts_with(level))
            .count()
    }
}

/// A mock engine and a handle wired to it.
pub fn mock_engine(runtime: MockRuntime) -> (Arc<MockRuntime>, Arc<EngineHandle>) {
    let runtime = Arc::new(runtime);
    let handle = Arc::new(EngineHandle::new(runtime.clone()));
    (runtime, handle)
}
