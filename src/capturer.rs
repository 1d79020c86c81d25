use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Local;

use crate::link::{open_live, OpenCaps};
use crate::worker::{StateCell, StopFlag, WorkerState};

const CAPTURE_SNAPLEN: i32 = 65535;
const CAPTURE_TIMEOUT_MS: i32 = 1000;
/// Packets handled between dump-file flushes.
const CAPTURE_BATCH: usize = 1000;
const STOP_POLL: Duration = Duration::from_millis(500);
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Streams filter-matched packets of one device into a pcap dump file.
///
/// The dump file is created fresh for every capturer and survives the
/// session so callers can collect it after `stop`.
pub struct PortCapturer {
    device: String,
    file_path: PathBuf,
    state: Arc<StateCell>,
    stop: StopFlag,
    thread: Option<JoinHandle<()>>,
}

impl PortCapturer {
    pub fn new(device: &str) -> PortCapturer {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let file_path = std::env::temp_dir().join(format!(
            "{}-capture-{}-{}-{}.pcap",
            env!("CARGO_PKG_NAME"),
            Local::now().format("%Y%m%d-%H%M%S"),
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed),
        ));
        if let Err(e) = std::fs::File::create(&file_path) {
            log::warn!("unable to create capture file {}: {e}", file_path.display());
        }
        log::debug!("capture file: {}", file_path.display());
        PortCapturer {
            device: device.to_owned(),
            file_path,
            state: StateCell::new(),
            stop: StopFlag::default(),
            thread: None,
        }
    }

    /// Start capturing under the given BPF filter. Returns once the worker
    /// has published its state; a filter that does not compile leaves the
    /// session `Finished` with nothing written.
    pub fn start(&mut self, filter: &str) {
        if self.state.is_running() {
            log::warn!("capture start requested but it is already running");
            return;
        }
        if let Some(handle) = self.thread.take() {
            handle.join().unwrap();
        }
        self.state.set(WorkerState::NotStarted);
        self.stop.clear();
        let device = self.device.clone();
        let filter = filter.to_owned();
        let path = self.file_path.clone();
        let state = Arc::clone(&self.state);
        let stop = self.stop.clone();
        let builder = thread::Builder::new().name(format!("capture-{}", self.device));
        self.thread = Some(
            builder
                .spawn(move || run_capture(&device, &filter, &path, &state, &stop))
                .unwrap(),
        );
        self.state.wait_while(|s| s == WorkerState::NotStarted);
    }

    /// Request a stop and wait for the worker to drain.
    pub fn stop(&mut self) {
        if !self.state.is_running() {
            log::warn!("capture stop requested but it is not running");
            return;
        }
        self.stop.request();
        while !self
            .state
            .wait_while_for(|s| s == WorkerState::Running, STOP_POLL)
        {
            log::debug!("capture stopping...");
        }
        if let Some(handle) = self.thread.take() {
            handle.join().unwrap();
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// The dump file packets are written into.
    pub fn capture_file(&self) -> &Path {
        &self.file_path
    }
}

impl Drop for PortCapturer {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn run_capture(device: &str, filter: &str, path: &Path, state: &StateCell, stop: &StopFlag) {
    // Promiscuous fallback only: there is no loopback axis for captures.
    let want = OpenCaps {
        promiscuous: true,
        no_local_capture: false,
    };
    let opened = open_live(device, CAPTURE_SNAPLEN, CAPTURE_TIMEOUT_MS, want);
    let (cap, _) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            log::warn!("error opening port {device}: {e}");
            state.set(WorkerState::Finished);
            return;
        }
    };
    let mut cap = match cap.setnonblock() {
        Ok(cap) => cap,
        Err(e) => {
            log::warn!("cannot set {device} non-blocking: {e}");
            state.set(WorkerState::Finished);
            return;
        }
    };
    // A filter that does not compile or install is fatal to the session.
    if let Err(e) = cap.filter(filter, true) {
        log::warn!("{device}: cannot apply capture filter \"{filter}\": {e}");
        state.set(WorkerState::Finished);
        return;
    }
    let mut savefile = match cap.savefile(path) {
        Ok(savefile) => savefile,
        Err(e) => {
            log::warn!("cannot open dump file {}: {e}", path.display());
            state.set(WorkerState::Finished);
            return;
        }
    };

    state.set(WorkerState::Running);
    'session: loop {
        for _ in 0..CAPTURE_BATCH {
            if stop.is_requested() {
                log::debug!("capture stop requested");
                break 'session;
            }
            match cap.next_packet() {
                Ok(pkt) => savefile.write(&pkt),
                Err(pcap::Error::TimeoutExpired) => thread::sleep(IDLE_POLL),
                Err(e) => {
                    log::warn!("{device}: error reading packet: {e}");
                    break 'session;
                }
            }
        }
        if let Err(e) = savefile.flush() {
            log::warn!("error flushing dump file: {e}");
            break;
        }
    }
    if let Err(e) = savefile.flush() {
        log::warn!("error flushing dump file: {e}");
    }
    stop.clear();
    state.set(WorkerState::Finished);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_file_is_created_up_front() {
        let capturer = PortCapturer::new("test0");
        assert!(capturer.capture_file().exists());
        assert!(!capturer.is_running());
        std::fs::remove_file(capturer.capture_file()).unwrap();
    }

    #[test]
    fn capture_files_are_distinct_per_capturer() {
        let a = PortCapturer::new("test0");
        let b = PortCapturer::new("test0");
        assert_ne!(a.capture_file(), b.capture_file());
        std::fs::remove_file(a.capture_file()).ok();
        std::fs::remove_file(b.capture_file()).ok();
    }
}
