//! The single worker that owns the serial link and a driver for the
//! duration of one action (§4.7): opens the [`Link`], runs the handshake,
//! dispatches to the matching [`AvrDriver`]/[`ArmDriver`], and always tears
//! the session back down, translating every outcome into exactly one
//! terminal [`Event`] plus whatever advisory progress/message events the
//! action produced along the way (§9 "scoped cleanup on all exit paths").

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{error, info};

use crate::arm::ArmDriver;
use crate::avr::AvrDriver;
use crate::bridge::Bridge;
use crate::codec::PacketCodec;
use crate::config::ProjectConfig;
use crate::device::DeviceDescriptor;
use crate::error::{PigroError, Result};
use crate::firmware::Firmware;
use crate::link::Link;

/// The closed set of actions a shell may submit (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Info,
    Stat,
    Check,
    Write,
    Erase,
    ReadFuse,
    WriteFuse,
    Read,
    Test,
}

/// Events pushed from the worker to whatever shell is draining [`Handle::events`]
/// (§4.7).
#[derive(Debug, Clone)]
pub enum Event {
    Started,
    Stopped,
    SessionStarted(u8, u8),
    BeginProgress(u32, u32),
    ReportProgress(u32),
    ReportMessage(String),
    ChipInfo(String),
    /// Carries the Intel HEX text of a `read` action's firmware, already
    /// serialized via [`Firmware::to_hex_string`] (§4.7 implementation note).
    DataReady(String),
    ReportResult(String),
    ReportException(String),
    EndProgress,
}

/// One submitted unit of work: an action against the project described by
/// `config_path`, to be run over whatever [`Link`] the orchestrator's link
/// factory opens next.
struct Job {
    config_path: PathBuf,
    action: Action,
}

/// Handle returned by [`Orchestrator::spawn`]: the request/event channel
/// pair plus the cancellation flag described in §3/§5.
pub struct Handle {
    requests: Sender<Job>,
    events: Receiver<Event>,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Handle {
    /// Enqueues `action` against the project file at `config_path`. Actions
    /// run strictly one at a time, FIFO, on the worker thread (§5).
    pub fn submit(&self, config_path: impl Into<PathBuf>, action: Action) {
        let job = Job {
            config_path: config_path.into(),
            action,
        };
        // The only way `send` fails is if the worker thread has already
        // exited (e.g. panicked); there's no request-side recovery from
        // that, so drop the job silently the way a closed pipe would.
        let _ = self.requests.send(job);
    }

    /// Sets the cooperative cancellation flag a driver's hot loops poll
    /// between pages/bytes/words (§5).
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Blocking receive of the next event. Returns `None` once the worker
    /// thread has shut down and the channel is drained.
    pub fn recv_event(&self) -> Option<Event> {
        self.events.recv().ok()
    }

    /// Non-blocking receive, for a shell that polls on its own schedule.
    pub fn try_recv_event(&self) -> Option<Event> {
        self.events.try_recv().ok()
    }

    /// Iterates every event until the worker thread shuts down.
    pub fn events(&self) -> impl Iterator<Item = Event> + '_ {
        self.events.iter()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        // Dropping `requests` closes the channel, which ends the worker's
        // `for job in &self.requests` loop; join so the thread doesn't
        // outlive its handle.
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Owns the worker loop (§4.7). Stateless beyond `spawn`: every action gets
/// a fresh [`Link`] (via `open_link`), [`Bridge`], and driver.
pub struct Orchestrator;

impl Orchestrator {
    /// Spawns the worker thread. `open_link` is called once per submitted
    /// action to acquire a fresh [`Link`] (e.g. `SerialLink::open(path)` in
    /// production, or a queue of pre-scripted [`crate::link::FakeLink`]s in
    /// tests) — the Link is owned exclusively by the worker for the
    /// duration of that one action, matching §5's resource model.
    pub fn spawn<F, L>(open_link: F) -> Handle
    where
        F: Fn() -> Result<L> + Send + 'static,
        L: Link + Send + 'static,
    {
        let (request_tx, request_rx) = mpsc::channel::<Job>();
        let (event_tx, event_rx) = mpsc::channel::<Event>();
        let cancel = Arc::new(AtomicBool::new(false));
        let worker_cancel = Arc::clone(&cancel);

        let worker = std::thread::spawn(move || {
            for job in request_rx {
                worker_cancel.store(false, Ordering::Relaxed);
                let _ = event_tx.send(Event::Started);
                run_job(&job, &open_link, &worker_cancel, &event_tx);
                let _ = event_tx.send(Event::Stopped);
            }
        });

        Handle {
            requests: request_tx,
            events: event_rx,
            cancel,
            worker: Some(worker),
        }
    }
}

/// Runs one job end to end, translating whatever the inner stages return
/// into exactly one of `ReportResult`/`ReportException`/`DataReady`, always
/// followed by `EndProgress` (§4.7 step 5, §7 "every action ends in exactly
/// one of...").
fn run_job<F, L>(job: &Job, open_link: &F, cancel: &Arc<AtomicBool>, events: &Sender<Event>)
where
    F: Fn() -> Result<L>,
    L: Link,
{
    let outcome = run_job_inner(job, open_link, cancel, events);
    if let Err(e) = outcome {
        error!("orchestrator: action failed: {e}");
        let _ = events.send(Event::ReportException(e.to_string()));
    }
    let _ = events.send(Event::EndProgress);
}

/// The actual §4.7 1-5 step sequence. Action handlers below are responsible
/// for sending their own terminal event (`ReportResult`/`DataReady`) on
/// success; this function (and its caller) only handle the catch-all
/// `ReportException` path for anything that propagates as `Err`.
fn run_job_inner<F, L>(job: &Job, open_link: &F, cancel: &Arc<AtomicBool>, events: &Sender<Event>) -> Result<()>
where
    F: Fn() -> Result<L>,
    L: Link,
{
    let config = ProjectConfig::load(&job.config_path)?;

    // `stat` reports firmware statistics without touching hardware at all
    // (§2B); every other action goes through the full link-open/handshake
    // session lifecycle.
    if job.action == Action::Stat {
        let firmware = load_firmware(&config)?;
        let stats = firmware.stats();
        let _ = events.send(Event::ReportResult(format!(
            "{} pages, {} bytes, {}% filled",
            stats.page_count, stats.byte_span, stats.fill_ratio
        )));
        return Ok(());
    }

    let link = open_link()?;
    let mut codec = PacketCodec::new(link);
    let (major, minor, nack_support) = codec.handshake()?;
    info!("orchestrator: session started, protocol {major}.{minor}, nack_support={nack_support}");
    let _ = events.send(Event::SessionStarted(major, minor));
    let bridge = Bridge::new(codec);

    match &config.device {
        DeviceDescriptor::Avr(device) => {
            let mut driver = AvrDriver::new(bridge, device.clone(), Arc::clone(cancel));
            let result = run_avr_action(job.action, &mut driver, &config, events);
            let close_result = driver.close();
            result.and(close_result)
        }
        DeviceDescriptor::Arm(device) => {
            let mut driver = ArmDriver::new(bridge, device.clone(), Arc::clone(cancel));
            let result = run_arm_action(job.action, &mut driver, &config, events);
            let close_result = driver.close();
            result.and(close_result)
        }
    }
}

fn load_firmware(config: &ProjectConfig) -> Result<Firmware> {
    let page_size = match &config.device {
        DeviceDescriptor::Avr(d) => d.page_byte_size(),
        DeviceDescriptor::Arm(d) => d.page_size,
    };
    let text = std::fs::read_to_string(&config.hex_path).map_err(PigroError::Io)?;
    Firmware::from_hex_str(&text, page_size, crate::firmware::DEFAULT_PAGE_FILL)
}

fn run_avr_action<L: Link>(
    action: Action,
    driver: &mut AvrDriver<L>,
    config: &ProjectConfig,
    events: &Sender<Event>,
) -> Result<()> {
    match action {
        Action::Info | Action::Test => {
            let info = driver.chip_info()?;
            let _ = events.send(Event::ChipInfo(format!(
                "{:02X?} [ {} ]",
                info.signature,
                if info.matches_expected { "ok" } else { "mismatch" }
            )));
            let _ = events.send(Event::ReportResult("chip info read".into()));
        }
        Action::Check => {
            let firmware = load_firmware(config)?;
            let _ = events.send(Event::BeginProgress(0, firmware.page_count() as u32));
            let report = driver.check_firmware_with_progress(&firmware, |n| {
                let _ = events.send(Event::ReportProgress(n));
            })?;
            if report.is_ok() {
                let _ = events.send(Event::ReportResult("firmware verified OK".into()));
            } else {
                let _ = events.send(Event::ReportException(format!(
                    "{} byte mismatches found during verification",
                    report.mismatches.len()
                )));
            }
        }
        Action::Write => {
            let firmware = load_firmware(config)?;
            let _ = events.send(Event::BeginProgress(0, firmware.page_count() as u32));
            driver.write_firmware_with_progress(&firmware, |n| {
                let _ = events.send(Event::ReportProgress(n));
            })?;
            let _ = events.send(Event::ReportResult("firmware written".into()));
        }
        Action::Erase => {
            driver.chip_erase()?;
            let _ = events.send(Event::ReportResult("chip erased".into()));
        }
        Action::ReadFuse => {
            let fuses = driver.read_fuse()?;
            let _ = events.send(Event::ReportResult(format!(
                "low={:#04x} high={:#04x} ext={:#04x}",
                fuses.low, fuses.high, fuses.ext
            )));
        }
        Action::WriteFuse => {
            driver.write_fuse()?;
            let _ = events.send(Event::ReportResult("fuses written".into()));
        }
        Action::Read => {
            let page_count = match &config.device {
                DeviceDescriptor::Avr(d) => d.page_count as u32,
                DeviceDescriptor::Arm(_) => unreachable!("avr branch"),
            };
            let _ = events.send(Event::BeginProgress(0, page_count));
            let firmware = driver.read_firmware_with_progress(|n| {
                let _ = events.send(Event::ReportProgress(n));
            })?;
            let _ = events.send(Event::DataReady(firmware.to_hex_string()));
        }
        Action::Stat => unreachable!("handled before driver construction"),
    }
    Ok(())
}

fn run_arm_action<L: Link>(
    action: Action,
    driver: &mut ArmDriver<L>,
    config: &ProjectConfig,
    events: &Sender<Event>,
) -> Result<()> {
    match action {
        Action::Info | Action::Test => {
            let info = driver.chip_info()?;
            let _ = events.send(Event::ChipInfo(format!(
                "{:#010x} [ {} ]",
                info.idcode,
                if info.matches_expected { "ok" } else { "mismatch" }
            )));
            let _ = events.send(Event::ReportResult("chip info read".into()));
        }
        Action::Check => {
            let firmware = load_firmware(config)?;
            let _ = events.send(Event::BeginProgress(0, firmware.page_count() as u32));
            let report = driver.check_firmware_with_progress(&firmware, |n| {
                let _ = events.send(Event::ReportProgress(n));
            })?;
            if report.is_ok() {
                let _ = events.send(Event::ReportResult("firmware verified OK".into()));
            } else {
                let _ = events.send(Event::ReportException(format!(
                    "{} word mismatches found during verification",
                    report.mismatches.len()
                )));
            }
        }
        Action::Write => {
            let firmware = load_firmware(config)?;
            let _ = events.send(Event::BeginProgress(0, firmware.page_count() as u32));
            driver.write_firmware_with_progress(&firmware, |n| {
                let _ = events.send(Event::ReportProgress(n));
            })?;
            let _ = events.send(Event::ReportResult("firmware written".into()));
        }
        Action::Erase => {
            driver.chip_erase()?;
            let _ = events.send(Event::ReportResult("chip erased".into()));
        }
        Action::ReadFuse | Action::WriteFuse => {
            // ARM parts have no fuse concept (§4.6): a documented no-op
            // failure, not a panic.
            return Err(PigroError::UnsupportedChip);
        }
        Action::Read => {
            let page_count = match &config.device {
                DeviceDescriptor::Arm(d) => d.page_count(),
                DeviceDescriptor::Avr(_) => unreachable!("arm branch"),
            };
            let _ = events.send(Event::BeginProgress(0, page_count));
            let firmware = driver.read_firmware_with_progress(|n| {
                let _ = events.send(Event::ReportProgress(n));
            })?;
            let _ = events.send(Event::DataReady(firmware.to_hex_string()));
        }
        Action::Stat => unreachable!("handled before driver construction"),
    }
    Ok(())
}
