use std::collections::HashSet;
use std::io::{self, Cursor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use dxgi_mirror::capture::{self, CaptureLoop, FrameSource, StartOutcome};
use dxgi_mirror::output::OutputImage;
use dxgi_mirror::settings::LoopSettings;
use image::{ImageBuffer, ImageFormat, Rgba, RgbaImage};
use parking_lot::Mutex;

#[derive(Clone, Copy)]
enum Behavior {
    Frames,
    Idle,
    Failing,
    IdleThenFrames(usize),
}

#[derive(Default)]
struct Stats {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    threads: Mutex<HashSet<ThreadId>>,
    thread_starts: AtomicUsize,
    thread_stops: AtomicUsize,
    hook_threads: Mutex<HashSet<ThreadId>>,
}

struct FakeSource {
    bitmap: Vec<u8>,
    behavior: Behavior,
    processing: Duration,
    stats: Arc<Stats>,
}

impl FakeSource {
    fn new(behavior: Behavior) -> (Self, Arc<Stats>) {
        let stats = Arc::new(Stats::default());
        let source = Self { bitmap: bitmap(32, 18), behavior, processing: Duration::ZERO, stats: stats.clone() };
        (source, stats)
    }

    fn processing(mut self, processing: Duration) -> Self {
        self.processing = processing;
        self
    }
}

impl FrameSource for FakeSource {
    type Error = io::Error;

    fn capture(&mut self) -> Result<Option<OutputImage<'_>>, Self::Error> {
        let call = self.stats.calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        self.stats.threads.lock().insert(thread::current().id());

        thread::sleep(self.processing);
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);

        let produce = match self.behavior {
            Behavior::Frames => true,
            Behavior::Idle => false,
            Behavior::Failing => return Err(io::Error::other("output disconnected")),
            Behavior::IdleThenFrames(idle) => call >= idle,
        };

        if produce { Ok(Some(OutputImage::new(&self.bitmap).map_err(io::Error::other)?)) } else { Ok(None) }
    }

    fn on_thread_start(&mut self) {
        self.stats.thread_starts.fetch_add(1, Ordering::SeqCst);
        self.stats.hook_threads.lock().insert(thread::current().id());
    }

    fn on_thread_stop(&mut self) {
        self.stats.thread_stops.fetch_add(1, Ordering::SeqCst);
        self.stats.hook_threads.lock().insert(thread::current().id());
    }
}

fn bitmap(width: u32, height: u32) -> Vec<u8> {
    let pixels: RgbaImage = ImageBuffer::from_pixel(width, height, Rgba([0x20, 0x40, 0x80, 0xff]));
    let mut bytes = Cursor::new(Vec::new());
    pixels.write_to(&mut bytes, ImageFormat::Bmp).unwrap();
    bytes.into_inner()
}

fn settings(fps: u32) -> LoopSettings {
    LoopSettings::new(fps).unwrap().scheduling_overhead(Duration::ZERO)
}

fn counting_callback() -> (Arc<AtomicUsize>, impl FnMut(OutputImage<'_>) + Send + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    (count, move |_image: OutputImage<'_>| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn delivers_frames_until_stopped() {
    let (source, _stats) = FakeSource::new(Behavior::Frames);
    let capture_loop = CaptureLoop::new(source);
    let (count, callback) = counting_callback();

    assert!(!capture_loop.is_running());
    assert_eq!(capture_loop.start(settings(100), callback).unwrap(), StartOutcome::Started);
    assert!(capture_loop.is_running());

    assert!(wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) >= 3));

    capture_loop.stop_and_wait().unwrap();
    assert!(!capture_loop.is_running());
}

#[test]
fn callback_receives_the_encoded_image() {
    let (source, _stats) = FakeSource::new(Behavior::Frames);
    let capture_loop = CaptureLoop::new(source);
    let sizes = Arc::new(Mutex::new(Vec::new()));

    let seen = sizes.clone();
    capture_loop
        .start(settings(100), move |image| {
            seen.lock().push((image.width(), image.height(), image.decode().is_ok()));
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || !sizes.lock().is_empty()));
    capture_loop.stop_and_wait().unwrap();

    assert!(sizes.lock().iter().all(|&size| size == (32, 18, true)));
}

#[test]
fn second_start_while_running_is_a_no_op() {
    let (source, stats) = FakeSource::new(Behavior::Frames);
    let capture_loop = CaptureLoop::new(source);

    let (_, first) = counting_callback();
    let (second_count, second) = counting_callback();

    assert_eq!(capture_loop.start(settings(100), first).unwrap(), StartOutcome::Started);
    assert_eq!(capture_loop.start(settings(100), second).unwrap(), StartOutcome::AlreadyRunning);

    assert!(wait_until(Duration::from_secs(5), || stats.calls.load(Ordering::SeqCst) >= 3));
    capture_loop.stop_and_wait().unwrap();

    assert_eq!(second_count.load(Ordering::SeqCst), 0);
    assert_eq!(stats.threads.lock().len(), 1);
}

#[test]
fn concurrent_starts_spawn_exactly_one_thread() {
    const CALLERS: usize = 8;

    let (source, stats) = FakeSource::new(Behavior::Frames);
    let capture_loop = Arc::new(CaptureLoop::new(source));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let callers: Vec<_> = (0..CALLERS)
        .map(|_| {
            let capture_loop = capture_loop.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let (_, callback) = counting_callback();
                barrier.wait();
                capture_loop.start(settings(200), callback).unwrap()
            })
        })
        .collect();

    let outcomes: Vec<StartOutcome> = callers.into_iter().map(|caller| caller.join().unwrap()).collect();
    let started = outcomes.iter().filter(|&&outcome| outcome == StartOutcome::Started).count();
    assert_eq!(started, 1, "outcomes: {outcomes:?}");

    assert!(wait_until(Duration::from_secs(5), || stats.calls.load(Ordering::SeqCst) >= 5));
    capture_loop.stop_and_wait().unwrap();

    assert_eq!(stats.threads.lock().len(), 1);
    assert_eq!(stats.max_in_flight.load(Ordering::SeqCst), 1);
}

#[test]
fn no_callbacks_after_stop_and_wait() {
    let (source, _stats) = FakeSource::new(Behavior::Frames);
    let capture_loop = CaptureLoop::new(source);
    let (count, callback) = counting_callback();

    capture_loop.start(settings(200), callback).unwrap();
    assert!(wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) >= 2));

    capture_loop.stop_and_wait().unwrap();
    let after_stop = count.load(Ordering::SeqCst);

    thread::sleep(Duration::from_millis(100));
    assert_eq!(count.load(Ordering::SeqCst), after_stop);
}

#[test]
fn start_and_stop_can_cycle() {
    let (source, stats) = FakeSource::new(Behavior::Frames);
    let capture_loop = CaptureLoop::new(source);

    for round in 1..=3 {
        let (count, callback) = counting_callback();
        assert_eq!(capture_loop.start(settings(100), callback).unwrap(), StartOutcome::Started, "round {round}");
        assert!(wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) >= 2));
        capture_loop.stop_and_wait().unwrap();
    }

    assert_eq!(stats.max_in_flight.load(Ordering::SeqCst), 1);
}

#[test]
fn restart_without_wait_joins_the_previous_thread() {
    let (source, stats) = FakeSource::new(Behavior::Frames);
    let source = source.processing(Duration::from_millis(20));
    let capture_loop = CaptureLoop::new(source);

    let (first_count, first) = counting_callback();
    capture_loop.start(settings(50), first).unwrap();
    assert!(wait_until(Duration::from_secs(5), || first_count.load(Ordering::SeqCst) >= 1));

    // The old thread may still be mid-cycle here
    capture_loop.stop();
    let (second_count, second) = counting_callback();
    assert_eq!(capture_loop.start(settings(50), second).unwrap(), StartOutcome::Started);

    let first_final = first_count.load(Ordering::SeqCst);
    assert!(wait_until(Duration::from_secs(5), || second_count.load(Ordering::SeqCst) >= 2));
    capture_loop.stop_and_wait().unwrap();

    assert_eq!(first_count.load(Ordering::SeqCst), first_final);
    assert_eq!(stats.max_in_flight.load(Ordering::SeqCst), 1);
}

#[test]
fn idle_cycles_keep_the_loop_scheduling() {
    let (source, stats) = FakeSource::new(Behavior::IdleThenFrames(3));
    let capture_loop = CaptureLoop::new(source);
    let (count, callback) = counting_callback();

    capture_loop.start(settings(100), callback).unwrap();
    assert!(wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) >= 1));
    capture_loop.stop_and_wait().unwrap();

    assert!(stats.calls.load(Ordering::SeqCst) >= 4);
}

#[test]
fn idle_cycles_sleep_the_full_budget() {
    let (source, stats) = FakeSource::new(Behavior::Idle);
    let capture_loop = CaptureLoop::new(source);
    let (count, callback) = counting_callback();

    capture_loop.start(settings(20), callback).unwrap();
    thread::sleep(Duration::from_millis(300));
    capture_loop.stop_and_wait().unwrap();

    // 50 ms per idle cycle over 300 ms
    let calls = stats.calls.load(Ordering::SeqCst);
    assert!((2..=8).contains(&calls), "calls: {calls}");
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn failures_never_stop_the_loop_without_a_limit() {
    let (source, stats) = FakeSource::new(Behavior::Failing);
    let capture_loop = CaptureLoop::new(source);
    let (count, callback) = counting_callback();

    capture_loop.start(settings(200), callback).unwrap();
    assert!(wait_until(Duration::from_secs(5), || stats.calls.load(Ordering::SeqCst) >= 10));

    assert!(capture_loop.is_running());
    capture_loop.stop_and_wait().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn failure_limit_stops_the_loop() {
    let (source, stats) = FakeSource::new(Behavior::Failing);
    let capture_loop = CaptureLoop::new(source);
    let (_, callback) = counting_callback();

    capture_loop.start(settings(200).failure_limit(Some(3)), callback).unwrap();
    assert!(wait_until(Duration::from_secs(5), || !capture_loop.is_running()));
    capture_loop.wait().unwrap();

    assert_eq!(stats.calls.load(Ordering::SeqCst), 3);

    // A stopped loop can be started again
    let (_, callback) = counting_callback();
    assert_eq!(capture_loop.start(settings(200), callback).unwrap(), StartOutcome::Started);
    capture_loop.stop_and_wait().unwrap();
}

#[test]
fn inter_frame_interval_converges_to_budget() {
    const FRAMES: usize = 15;

    let (source, _stats) = FakeSource::new(Behavior::Frames);
    let source = source.processing(Duration::from_millis(5));
    let capture_loop = CaptureLoop::new(source);
    let stamps = Arc::new(Mutex::new(Vec::new()));

    let recorded = stamps.clone();
    capture_loop.start(settings(50), move |_| recorded.lock().push(Instant::now())).unwrap();
    assert!(wait_until(Duration::from_secs(5), || stamps.lock().len() >= FRAMES));
    capture_loop.stop_and_wait().unwrap();

    let stamps = stamps.lock();
    let span = stamps[FRAMES - 1].duration_since(stamps[0]);
    let mean = span / u32::try_from(FRAMES - 1).unwrap();

    // Budget is 20 ms; allow for scheduler jitter on busy machines
    assert!(mean >= Duration::from_millis(18), "mean interval {mean:?}");
    assert!(mean <= Duration::from_millis(30), "mean interval {mean:?}");
}

#[test]
fn source_can_be_used_directly_while_idle() {
    let (source, stats) = FakeSource::new(Behavior::Frames);
    let capture_loop = CaptureLoop::new(source);

    let mut source = capture_loop.source();
    let image = source.capture().unwrap().unwrap();
    assert_eq!((image.width(), image.height()), (32, 18));
    drop(source);

    assert_eq!(stats.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn dropping_the_loop_joins_its_thread() {
    let (source, _stats) = FakeSource::new(Behavior::Frames);
    let capture_loop = CaptureLoop::new(source);
    let (count, callback) = counting_callback();

    capture_loop.start(settings(200), callback).unwrap();
    assert!(wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) >= 1));
    drop(capture_loop);

    let after_drop = count.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(count.load(Ordering::SeqCst), after_drop);
}

#[test]
fn panicking_callback_leaves_the_loop_restartable() {
    let (source, _stats) = FakeSource::new(Behavior::Frames);
    let capture_loop = CaptureLoop::new(source);

    capture_loop.start(settings(200), |_| panic!("callback failed")).unwrap();
    assert!(wait_until(Duration::from_secs(5), || !capture_loop.is_running()));
    assert!(matches!(capture_loop.wait(), Err(capture::Error::FailedToJoinThread)));

    let (count, callback) = counting_callback();
    assert_eq!(capture_loop.start(settings(200), callback).unwrap(), StartOutcome::Started);
    assert!(wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) >= 1));
    capture_loop.stop_and_wait().unwrap();
}

#[test]
fn zero_failure_limit_keeps_a_healthy_loop_running() {
    let (source, stats) = FakeSource::new(Behavior::Frames);
    let capture_loop = CaptureLoop::new(source);
    let (count, callback) = counting_callback();

    capture_loop.start(settings(100).failure_limit(Some(0)), callback).unwrap();
    assert!(wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) >= 5));

    assert!(capture_loop.is_running());
    capture_loop.stop_and_wait().unwrap();
    assert!(stats.calls.load(Ordering::SeqCst) >= 5);
}

#[test]
fn zero_failure_limit_retries_failures_forever() {
    let (source, stats) = FakeSource::new(Behavior::Failing);
    let capture_loop = CaptureLoop::new(source);
    let (_, callback) = counting_callback();

    capture_loop.start(settings(200).failure_limit(Some(0)), callback).unwrap();
    assert!(wait_until(Duration::from_secs(5), || stats.calls.load(Ordering::SeqCst) >= 10));

    assert!(capture_loop.is_running());
    capture_loop.stop_and_wait().unwrap();
}

#[test]
fn callback_can_stop_and_wait_on_its_own_loop() {
    let (source, _stats) = FakeSource::new(Behavior::Frames);
    let capture_loop = Arc::new(CaptureLoop::new(source));
    let results = Arc::new(Mutex::new(Vec::new()));

    let handle: Weak<CaptureLoop<FakeSource>> = Arc::downgrade(&capture_loop);
    let recorded = results.clone();
    capture_loop
        .start(settings(100), move |_| {
            if let Some(capture_loop) = handle.upgrade() {
                recorded.lock().push((capture_loop.on_loop_thread(), capture_loop.stop_and_wait().is_ok()));
            }
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || !capture_loop.is_running()));
    capture_loop.wait().unwrap();

    assert_eq!(*results.lock(), vec![(true, true)]);
    assert!(!capture_loop.on_loop_thread());
}

#[test]
fn restart_from_callback_is_refused() {
    let (source, _stats) = FakeSource::new(Behavior::Frames);
    let capture_loop = Arc::new(CaptureLoop::new(source));
    let results = Arc::new(Mutex::new(Vec::new()));

    let handle = Arc::downgrade(&capture_loop);
    let recorded = results.clone();
    capture_loop
        .start(settings(100), move |_| {
            if let Some(capture_loop) = handle.upgrade() {
                let running = capture_loop.start(settings(100), |_| {});
                capture_loop.stop();
                let stopped = capture_loop.start(settings(100), |_| {});
                recorded.lock().push((
                    matches!(running, Ok(StartOutcome::AlreadyRunning)),
                    matches!(stopped, Err(capture::Error::RestartFromLoopThread)),
                ));
            }
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || !capture_loop.is_running()));
    capture_loop.wait().unwrap();

    assert_eq!(*results.lock(), vec![(true, true)]);
}

#[test]
fn thread_hooks_run_once_per_loop_thread() {
    let (source, stats) = FakeSource::new(Behavior::Frames);
    let capture_loop = CaptureLoop::new(source);

    for round in 1..=2 {
        let (count, callback) = counting_callback();
        capture_loop.start(settings(100), callback).unwrap();
        assert!(wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) >= 1));
        capture_loop.stop_and_wait().unwrap();

        assert_eq!(stats.thread_starts.load(Ordering::SeqCst), round);
        assert_eq!(stats.thread_stops.load(Ordering::SeqCst), round);
    }

    // Hooks run on the loop threads, never on the caller
    let hook_threads = stats.hook_threads.lock();
    assert!(!hook_threads.contains(&thread::current().id()));
    assert!(hook_threads.is_subset(&stats.threads.lock()));
}

#[test]
fn thread_stop_hook_runs_when_the_callback_panics() {
    let (source, stats) = FakeSource::new(Behavior::Frames);
    let capture_loop = CaptureLoop::new(source);

    capture_loop.start(settings(200), |_| panic!("callback failed")).unwrap();
    assert!(wait_until(Duration::from_secs(5), || !capture_loop.is_running()));
    assert!(capture_loop.wait().is_err());

    assert_eq!(stats.thread_starts.load(Ordering::SeqCst), 1);
    assert_eq!(stats.thread_stops.load(Ordering::SeqCst), 1);
}
