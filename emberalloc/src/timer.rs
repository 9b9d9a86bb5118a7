//! The repeating wall-clock tick that drives thread-cache decay.
//!
//! Each thread descriptor owns a [`Ticker`]: a dedicated thread that invokes
//! a callback every period until the handle is dropped. A channel doubles as
//! the interruptible sleep, so dropping the handle wakes the thread
//! immediately instead of waiting out the period.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::trace;

pub(crate) struct Ticker {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Invoke `tick` roughly every `period` on a dedicated thread.
    pub fn spawn<F>(period: Duration, mut tick: F) -> Ticker
    where
        F: FnMut() + Send + 'static,
    {
        let (stop, wakeup) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name("emberalloc-purge".into())
            .spawn(move || loop {
                match wakeup.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => tick(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        trace!("purge ticker stopping");
                        return;
                    }
                }
            })
            .expect("spawning the purge timer thread should not fail");
        Ticker {
            stop: Some(stop),
            thread: Some(thread),
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        // closing the channel wakes the sleeper, which then exits
        drop(self.stop.take());
        if let Some(handle) = self.thread.take() {
            // a tick can hold the last reference to its own descriptor, in
            // which case this drop runs on the ticker thread itself and a
            // join would wait on the current thread forever
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn ticks_repeatedly() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let ticker = Ticker::spawn(Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        thread::sleep(Duration::from_millis(200));
        drop(ticker);
        assert!(hits.load(Ordering::Relaxed) >= 2);
    }

    #[test]
    fn drop_stops_promptly() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let ticker = Ticker::spawn(Duration::from_secs(3600), move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        // dropping must not wait out the hour-long period
        drop(ticker);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }
}
