/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/ingest/progress.rs
 *
 * A single-line progress reporter for long-running collection phases. The
 * handle is cheap to clone and shared across shard tasks; pause/resume keeps
 * the line silent while the operator is being prompted for credentials.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone, Default)]
pub struct Progress {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    running: AtomicBool,
    paused: AtomicBool,
    count: AtomicI64,
    state: Mutex<Option<State>>,
}

struct State {
    message: String,
    started: Instant,
    resumed: Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins a new phase with an optional starting count, spawning the
    /// one-second render ticker. A phase already running is left alone.
    pub fn start(&self, message: &str) {
        self.start_at(message, 0);
    }

    pub fn start_at(&self, message: &str, initial: i64) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.count.store(initial, Ordering::SeqCst);
        let now = Instant::now();
        *self.inner.state.lock().unwrap() = Some(State {
            message: message.to_string(),
            started: now,
            resumed: now,
        });

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if !inner.running.load(Ordering::SeqCst) {
                    return;
                }
                if !inner.paused.load(Ordering::SeqCst) {
                    inner.render(false);
                }
            }
        });
    }

    pub fn add(&self, n: i64) {
        self.inner.count.fetch_add(n, Ordering::Relaxed);
    }

    /// Silences the line (used during interactive reauthentication).
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        if let Some(state) = self.inner.state.lock().unwrap().as_mut() {
            state.resumed = Instant::now();
        }
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    /// Ends the phase and prints the final tally.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            self.inner.render(true);
        }
    }
}

impl Inner {
    fn render(&self, finished: bool) {
        let state = self.state.lock().unwrap();
        let Some(state) = state.as_ref() else { return };
        let count = self.count.load(Ordering::Relaxed);
        let total = fmt_elapsed(state.started.elapsed());
        let since_resume = fmt_elapsed(state.resumed.elapsed());
        let label = if finished { "Total stats" } else { "Progress" };
        let terminator = if finished { "\n" } else { "\r" };
        print!(
            "{}: {} {} (Total Time: {}, Since last pause: {}){}",
            label, count, state.message, total, since_resume, terminator
        );
        let _ = std::io::stdout().flush();
    }
}

fn fmt_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_accumulate_across_clones() {
        let progress = Progress::new();
        progress.start("things processed");
        let clone = progress.clone();
        clone.add(3);
        progress.add(2);
        assert_eq!(progress.inner.count.load(Ordering::Relaxed), 5);
        progress.stop();
    }

    #[tokio::test]
    async fn restart_after_stop_resets_the_count() {
        let progress = Progress::new();
        progress.start("first phase");
        progress.add(10);
        progress.stop();
        progress.start("second phase");
        assert_eq!(progress.inner.count.load(Ordering::Relaxed), 0);
        progress.stop();
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(fmt_elapsed(Duration::from_secs(0)), "00:00:00");
        assert_eq!(fmt_elapsed(Duration::from_secs(3_725)), "01:02:05");
    }
}
