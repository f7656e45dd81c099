//! Background polling of the port scanner.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::debug;

use super::{PortEnumerator, ScanResult, UsbId, scan};
use crate::event::{Event, EventSink};

/// Default interval between scans.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

const STOP_CHECK_SLICE: Duration = Duration::from_millis(50);

/// Polls [`scan`] on a background thread and posts [`Event::Detection`]
/// whenever the result changes.
///
/// Dropping the watcher stops it; the thread exits within one poll interval.
pub struct PortWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PortWatcher {
    /// Start polling.
    pub fn spawn(
        enumerator: Arc<dyn PortEnumerator>,
        id: UsbId,
        interval: Duration,
        events: EventSink,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            let mut last: Option<ScanResult> = None;

            while !flag.load(Ordering::Relaxed) {
                let result = scan(enumerator.as_ref(), id);
                if last.as_ref() != Some(&result) {
                    debug!("Detection changed: {:?}", result.status);
                    events.send(Event::Detection(result.clone()));
                    last = Some(result);
                }

                let deadline = Instant::now() + interval;
                while !flag.load(Ordering::Relaxed) && Instant::now() < deadline {
                    thread::sleep(STOP_CHECK_SLICE.min(interval));
                }
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Request the thread to stop and wait for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PortWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
