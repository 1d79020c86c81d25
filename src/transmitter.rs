use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::link::{LinkError, PcapTxLink, TxLink};
use crate::pacing::{pacer_for, settle_delay, OsSleep, Pacer, RateAccuracy};
use crate::sequence::{PacketList, PacketSequence};
use crate::stats::{PortStats, StatsSnapshot};
use crate::worker::{StateCell, StopFlag, WorkerState};

/// Sequences whose one-pass duration exceeds this are never submitted in
/// bulk: a bulk call cannot observe a stop request mid-sequence.
const BULK_DURATION_LIMIT_USEC: i64 = 1_000_000;

#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("transmit already running")]
    AlreadyRunning,
    #[error("packet list has an unterminated packet set")]
    OpenRepeatBlock,
    #[error("no transmit link available")]
    NoLink,
    #[error("stop requested")]
    Stopped,
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Everything the transmit worker needs, moved into the worker thread at
/// `start` and recovered through the join. While the session is out, the
/// packet list cannot be touched — which is exactly the contract.
struct TxSession {
    list: PacketList,
    link: Option<Box<dyn TxLink>>,
    pacer: Box<dyn Pacer>,
    stats: Arc<PortStats>,
}

/// The transmit scheduler of one port.
///
/// The upstream producer fills the packet list through
/// [`append_to_packet_list`](PortTransmitter::append_to_packet_list) and
/// [`loop_next_packet_set`](PortTransmitter::loop_next_packet_set); `start`
/// hands the list to a worker thread that emits it with microsecond pacing,
/// compensating scheduled delays for the time already burnt by the sends
/// themselves.
pub struct PortTransmitter {
    session: Option<TxSession>,
    thread: Option<JoinHandle<TxSession>>,
    state: Arc<StateCell>,
    stop: StopFlag,
    stats: Arc<PortStats>,
}

impl PortTransmitter {
    /// Create a transmitter with an internally owned handle on `device`.
    pub fn new(device: &str) -> PortTransmitter {
        let link = PcapTxLink::open_internal(device)
            .map(|l| Box::new(l) as Box<dyn TxLink>);
        PortTransmitter::build(link)
    }

    /// Create a transmitter emitting through the given link. The packet
    /// layer is never touched; tests inject recording links here.
    pub fn with_link(link: Box<dyn TxLink>) -> PortTransmitter {
        PortTransmitter::build(Some(link))
    }

    fn build(link: Option<Box<dyn TxLink>>) -> PortTransmitter {
        let stats = Arc::new(PortStats::default());
        PortTransmitter {
            session: Some(TxSession {
                list: PacketList::new(),
                link,
                pacer: Box::new(OsSleep),
                stats: Arc::clone(&stats),
            }),
            thread: None,
            state: StateCell::new(),
            stop: StopFlag::default(),
            stats,
        }
    }

    /// Recover the session from a worker that finished on its own.
    fn reap(&mut self) {
        if self.session.is_none()
            && self.thread.is_some()
            && self.state.get() == WorkerState::Finished
        {
            let handle = self.thread.take().expect("thread presence just checked");
            self.session = Some(handle.join().unwrap());
        }
    }

    fn with_session<R>(&mut self, what: &str, f: impl FnOnce(&mut TxSession) -> R) -> Option<R> {
        self.reap();
        match self.session.as_mut() {
            Some(session) => Some(f(session)),
            None => {
                log::warn!("{what} ignored while transmit is running");
                None
            }
        }
    }

    pub fn clear_packet_list(&mut self) {
        self.with_session("packet list clear", |s| s.list.clear());
    }

    /// Append one packet with its absolute timestamp; only the deltas
    /// between timestamps matter. Returns false when the packet does not
    /// fit or the transmitter is running.
    pub fn append_to_packet_list(&mut self, ts: Duration, data: &[u8], wire_len: u32) -> bool {
        self.with_session("packet append", |s| s.list.append(ts, data, wire_len))
            .unwrap_or(false)
    }

    /// Open a repeat block: the next `size` packets form a set replayed
    /// `repeats` times with `delay` after each replay.
    pub fn loop_next_packet_set(&mut self, size: u64, repeats: u64, delay: Duration) {
        self.with_session("packet set", |s| s.list.loop_next_packet_set(size, repeats, delay));
    }

    pub fn set_packet_list_loop_mode(&mut self, enabled: bool, delay: Duration) {
        self.with_session("loop mode change", |s| s.list.set_loop_mode(enabled, delay));
    }

    /// Select the pacing primitive. Returns false when the transmitter is
    /// running and the selection was ignored.
    pub fn set_rate_accuracy(&mut self, accuracy: RateAccuracy) -> bool {
        let applied = self
            .with_session("rate accuracy change", |s| s.pacer = pacer_for(accuracy))
            .is_some();
        if applied {
            match accuracy {
                RateAccuracy::High => log::info!("rate accuracy set to high: busy wait"),
                RateAccuracy::Low => log::info!("rate accuracy set to low: OS sleep"),
            }
        }
        applied
    }

    /// Replace the pacing primitive wholesale (tests inject recording
    /// pacers here).
    pub fn set_pacer(&mut self, pacer: Box<dyn Pacer>) -> bool {
        self.with_session("pacer change", |s| s.pacer = pacer).is_some()
    }

    /// Replace the emission link. An internally owned handle is closed by
    /// the replacement; a shared handle stays with its lender.
    pub fn set_link(&mut self, link: Box<dyn TxLink>) {
        self.with_session("link change", |s| s.link = Some(link));
    }

    /// Route counter updates into an externally owned stats block instead
    /// of the private one.
    pub fn use_external_stats(&mut self, stats: Arc<PortStats>) {
        let replacement = Arc::clone(&stats);
        if self
            .with_session("stats rebind", |s| s.stats = replacement)
            .is_some()
        {
            self.stats = stats;
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Spawn the worker and return once it has published `Running` (or
    /// finished outright on an empty list): an immediately-following
    /// [`is_running`](PortTransmitter::is_running) observes the truth.
    pub fn start(&mut self) -> Result<(), TransmitError> {
        self.reap();
        if self.state.is_running() {
            log::warn!("transmit start requested but it is already running");
            return Err(TransmitError::AlreadyRunning);
        }
        let session = self.session.take().ok_or(TransmitError::AlreadyRunning)?;
        if session.link.is_none() {
            self.session = Some(session);
            return Err(TransmitError::NoLink);
        }
        if session.list.has_open_repeat_block() {
            self.session = Some(session);
            return Err(TransmitError::OpenRepeatBlock);
        }

        self.state.set(WorkerState::NotStarted);
        // A stop that raced a natural finish must not leak into this run.
        self.stop.clear();
        let state = Arc::clone(&self.state);
        let stop = self.stop.clone();
        let builder = thread::Builder::new().name("port-tx".into());
        self.thread = Some(
            builder
                .spawn(move || {
                    let mut session = session;
                    run_worker(&mut session, &state, &stop);
                    session
                })
                .unwrap(),
        );
        self.state.wait_while(|s| s == WorkerState::NotStarted);
        Ok(())
    }

    /// Request a cooperative stop and block until the worker has finished.
    /// A stop while not running is a no-op warning.
    pub fn stop(&mut self) {
        self.reap();
        if self.state.is_running() {
            self.stop.request();
            self.state.wait_while(|s| s == WorkerState::Running);
            self.reap();
        } else {
            log::warn!("transmit stop requested but it is not running");
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }
}

impl Drop for PortTransmitter {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn run_worker(session: &mut TxSession, state: &StateCell, stop: &StopFlag) {
    let TxSession {
        list,
        link,
        pacer,
        stats,
    } = session;
    let link = link.as_mut().expect("start checked the link").as_mut();
    let pacer = pacer.as_ref();

    log::debug!("packet list: {} sequences", list.sequences().len());
    for (i, seq) in list.sequences().iter().enumerate() {
        log::debug!(
            "seq[{i}]: pkts={}, bytes={}, rpt_cnt={}, rpt_sz={}, duration={}us, delay={}us",
            seq.packets(),
            seq.bytes(),
            seq.repeat_count(),
            seq.repeat_size(),
            seq.usec_duration(),
            seq.usec_delay(),
        );
    }

    if list.is_empty() {
        stop.clear();
        state.set(WorkerState::Finished);
        return;
    }

    state.set(WorkerState::Running);
    let outcome = emit_list(list, link, pacer, stats, stop);
    match outcome {
        Ok(()) => log::debug!("transmit pass complete"),
        Err(TransmitError::Stopped) => log::debug!("transmit stop honored"),
        Err(e) => log::error!("transmit aborted: {e}"),
    }
    stop.clear();
    state.set(WorkerState::Finished);
}

/// One full run over the list, honoring repeat blocks and the global loop.
///
/// `overhead` is the cumulative compensator: always <= 0, it carries the
/// time already consumed by transmit calls that has not yet been charged
/// against a scheduled delay.
fn emit_list(
    list: &PacketList,
    link: &mut dyn TxLink,
    pacer: &dyn Pacer,
    stats: &PortStats,
    stop: &StopFlag,
) -> Result<(), TransmitError> {
    let seqs = list.sequences();
    let mut overhead: i64 = 0;
    let mut start_at = 0;
    loop {
        let mut i = start_at;
        while i < seqs.len() {
            let rpt_sz = seqs[i].repeat_size() as usize;
            let rpt_cnt = seqs[i].repeat_count();
            for _ in 0..rpt_cnt {
                for k in 0..rpt_sz {
                    if stop.is_requested() {
                        return Err(TransmitError::Stopped);
                    }
                    let seq = &seqs[i + k];
                    transmit_sequence(seq, link, pacer, stats, stop, &mut overhead)?;
                    overhead = apply_delay(seq.usec_delay(), overhead, pacer);
                }
            }
            i += rpt_sz;
        }
        match list.return_to_idx() {
            Some(idx) if idx < seqs.len() => {
                overhead = apply_delay(list.loop_delay_usec(), overhead, pacer);
                start_at = idx;
            }
            _ => return Ok(()),
        }
    }
}

fn apply_delay(delay_usec: i64, overhead: i64, pacer: &dyn Pacer) -> i64 {
    let (sleep, residual) = settle_delay(delay_usec, overhead);
    if sleep > 0 {
        pacer.udelay(sleep);
    }
    residual
}

/// Emit one sequence, preferring the link's bulk path when it exists and
/// the sequence is short enough to keep the stop latency bounded.
fn transmit_sequence(
    seq: &PacketSequence,
    link: &mut dyn TxLink,
    pacer: &dyn Pacer,
    stats: &PortStats,
    stop: &StopFlag,
    overhead: &mut i64,
) -> Result<(), TransmitError> {
    if seq.usec_duration() <= BULK_DURATION_LIMIT_USEC {
        let mark = Instant::now();
        if let Some(outcome) = link.send_sequence(seq) {
            outcome?;
            stats.record_tx(seq.packets(), seq.bytes());
            let elapsed = mark.elapsed().as_micros() as i64;
            *overhead += seq.usec_duration() - elapsed;
            debug_assert!(*overhead <= 0);
            if stop.is_requested() {
                return Err(TransmitError::Stopped);
            }
            return Ok(());
        }
    }
    transmit_sequence_manual(seq, link, pacer, stats, stop, overhead)
}

/// Walk a sequence record by record: charge the measured overhead against
/// each intended inter-packet delay, sleep the remainder when positive, and
/// carry the deficit otherwise.
fn transmit_sequence_manual(
    seq: &PacketSequence,
    link: &mut dyn TxLink,
    pacer: &dyn Pacer,
    stats: &PortStats,
    stop: &StopFlag,
    overhead: &mut i64,
) -> Result<(), TransmitError> {
    let mut prev_ts: Option<i64> = None;
    let mut mark = Instant::now();
    for rec in seq.iter() {
        let desired = prev_ts.map_or(0, |prev| rec.ts_usec - prev);
        *overhead -= mark.elapsed().as_micros() as i64;
        debug_assert!(*overhead <= 0);
        let (sleep, residual) = settle_delay(desired, *overhead);
        if sleep > 0 {
            pacer.udelay(sleep);
        }
        *overhead = residual;
        prev_ts = Some(rec.ts_usec);
        mark = Instant::now();
        link.send(rec.data)?;
        stats.record_tx(1, rec.len as u64);
        if stop.is_requested() {
            return Err(TransmitError::Stopped);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every packet instead of touching the packet layer.
    struct RecordingLink {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        fail_after: Option<usize>,
    }

    impl RecordingLink {
        fn new() -> (RecordingLink, Arc<Mutex<Vec<Vec<u8>>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            (
                RecordingLink {
                    sent: Arc::clone(&sent),
                    fail_after: None,
                },
                sent,
            )
        }
    }

    impl TxLink for RecordingLink {
        fn send(&mut self, pkt: &[u8]) -> Result<(), LinkError> {
            let mut sent = self.sent.lock().unwrap();
            if let Some(limit) = self.fail_after {
                if sent.len() >= limit {
                    return Err(LinkError::Send("link down".into()));
                }
            }
            sent.push(pkt.to_vec());
            Ok(())
        }
    }

    fn transmitter_with(link: RecordingLink) -> PortTransmitter {
        let mut tx = PortTransmitter::with_link(Box::new(link));
        // Tests pace through the real OS sleep only for tiny delays.
        tx.set_rate_accuracy(RateAccuracy::Low);
        tx
    }

    #[test]
    fn start_refuses_an_open_repeat_block() {
        let (link, _) = RecordingLink::new();
        let mut tx = transmitter_with(link);
        tx.loop_next_packet_set(3, 2, Duration::ZERO);
        tx.append_to_packet_list(Duration::ZERO, &[0; 64], 64);
        assert!(matches!(tx.start(), Err(TransmitError::OpenRepeatBlock)));
        assert!(!tx.is_running());
    }

    #[test]
    fn start_without_a_link_fails() {
        let mut tx = PortTransmitter::build(None);
        tx.append_to_packet_list(Duration::ZERO, &[0; 64], 64);
        assert!(matches!(tx.start(), Err(TransmitError::NoLink)));
    }

    #[test]
    fn empty_list_finishes_without_running() {
        let (link, sent) = RecordingLink::new();
        let mut tx = transmitter_with(link);
        tx.start().unwrap();
        // The worker publishes a terminal state before start returns.
        assert!(!tx.is_running());
        tx.stop(); // no-op warning
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn builder_calls_are_rejected_while_running() {
        let (link, sent) = RecordingLink::new();
        let mut tx = transmitter_with(link);
        for i in 0..50u64 {
            tx.append_to_packet_list(Duration::from_millis(i * 10), &[i as u8; 64], 64);
        }
        tx.set_packet_list_loop_mode(true, Duration::from_millis(1));
        tx.start().unwrap();
        assert!(tx.is_running());
        // All of these must be ignored, not corrupt the running list.
        assert!(!tx.append_to_packet_list(Duration::ZERO, &[0; 64], 64));
        assert!(!tx.set_rate_accuracy(RateAccuracy::Low));
        tx.clear_packet_list();
        while sent.lock().unwrap().is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        tx.stop();
        assert!(!tx.is_running());
        assert!(!sent.lock().unwrap().is_empty());
    }

    #[test]
    fn transmit_error_finishes_the_session() {
        let (mut link, sent) = RecordingLink::new();
        link.fail_after = Some(2);
        let mut tx = transmitter_with(link);
        for i in 0..5u64 {
            tx.append_to_packet_list(Duration::from_micros(i), &[i as u8; 64], 64);
        }
        tx.start().unwrap();
        // The worker dies on the third send; wait for it to publish.
        tx.state.wait_while(|s| s == WorkerState::Running);
        assert!(!tx.is_running());
        assert_eq!(sent.lock().unwrap().len(), 2);
        assert_eq!(tx.stats().tx_pkts, 2);
    }

    #[test]
    fn session_is_reusable_after_a_run() {
        let (link, sent) = RecordingLink::new();
        let mut tx = transmitter_with(link);
        tx.append_to_packet_list(Duration::ZERO, &[1; 64], 64);
        tx.start().unwrap();
        tx.state.wait_while(|s| s == WorkerState::Running);

        // The list survives the worker round-trip: a second start replays it.
        tx.start().unwrap();
        tx.state.wait_while(|s| s == WorkerState::Running);
        assert_eq!(sent.lock().unwrap().len(), 2);
        assert_eq!(tx.stats().tx_pkts, 2);
    }

    #[test]
    fn external_stats_take_over_accounting() {
        let (link, _) = RecordingLink::new();
        let mut tx = transmitter_with(link);
        let external = Arc::new(PortStats::default());
        tx.use_external_stats(Arc::clone(&external));
        tx.append_to_packet_list(Duration::ZERO, &[1; 60], 60);
        tx.start().unwrap();
        tx.state.wait_while(|s| s == WorkerState::Running);
        assert_eq!(external.snapshot().tx_pkts, 1);
        assert_eq!(external.snapshot().tx_bytes, 60);
    }
}
