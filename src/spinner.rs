//! Terminal feedback while the engine works on a model.

use std::io::Write;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

/// Braille spinner frames.
const FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

const INTERVAL: Duration = Duration::from_millis(80);

/// A spinner with an elapsed-time counter, drawn on stderr by a background task.
///
/// Generation and solving can take minutes, so the line shows how long the
/// current step has been running.
pub struct Spinner {
    handle: JoinHandle<()>,
    cancel: tokio::sync::watch::Sender<bool>,
    started: Instant,
}

impl Spinner {
    /// Start a spinner labelled `message` (e.g. `"running model"`).
    pub fn start(message: &str) -> Self {
        let (cancel_tx, mut cancel_rx) = tokio::sync::watch::channel(false);
        let message = message.to_string();
        let started = Instant::now();

        let handle = tokio::spawn(async move {
            let mut i = 0;
            loop {
                let frame = FRAMES[i % FRAMES.len()];
                eprint!(
                    "\x1b[2K\r{frame} {message} ({})",
                    format_elapsed(started.elapsed())
                );
                let _ = std::io::stderr().flush();

                tokio::select! {
                    _ = tokio::time::sleep(INTERVAL) => {}
                    _ = cancel_rx.changed() => break,
                }
                i += 1;
            }
            eprint!("\x1b[2K\r");
            let _ = std::io::stderr().flush();
        });

        Self {
            handle,
            cancel: cancel_tx,
            started,
        }
    }

    /// Stop the spinner, clear its line, and return how long it ran.
    pub async fn stop(self) -> Duration {
        let _ = self.cancel.send(true);
        let _ = self.handle.await;
        self.started.elapsed()
    }
}

/// `m:ss` for durations under an hour, `h:mm:ss` above.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_single_braille_chars() {
        for frame in FRAMES {
            assert_eq!(frame.chars().count(), 1);
        }
    }

    #[test]
    fn elapsed_under_an_hour() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "0:00");
        assert_eq!(format_elapsed(Duration::from_secs(75)), "1:15");
        assert_eq!(format_elapsed(Duration::from_millis(59_900)), "0:59");
    }

    #[test]
    fn elapsed_over_an_hour() {
        assert_eq!(format_elapsed(Duration::from_secs(3600 + 62)), "1:01:02");
    }

    #[tokio::test]
    async fn spinner_reports_elapsed_time() {
        let spinner = Spinner::start("testing");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(spinner.stop().await >= Duration::from_millis(100));
    }
}
