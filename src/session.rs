//! Live playback — one adjustable session at a time.
//!
//! [`Lab::play`] builds a [`LiveGraph`] (strategy instance plus signal
//! path) and parks it behind a mutex shared with [`PlaybackOutput`], the
//! handle an audio callback pulls interleaved frames from. Parameter
//! updates retarget the running graph; they never rebuild it.
//!
//! Nothing on the audio side waits on a subscriber or frees the graph:
//! waveform frames go through a try-lock slot, and a finished graph stays
//! parked until the control side stops or replaces the session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::buffer::{AudioBuffer, trim};
use crate::dsp::reverb::{ImpulseCache, convolver_bank};
use crate::dsp::smoothing::LIVE_RAMP_MS;
use crate::path::{SignalPath, planned_frames};
use crate::settings::{FxKind, ReverbParams, Settings};
use crate::stretch::{LiveSource, StretchBackend, Wsola};

/// Mono samples per waveform frame.
pub const WAVEFORM_FRAME: usize = 1024;

/// Waveform frames published per second of audio.
pub const WAVEFORM_RATE_HZ: u32 = 60;

type EndCallback = Box<dyn FnOnce() + Send>;

/// Fires the completion callback at most once, from whichever of stop or
/// natural completion gets there first.
struct EndGuard {
    ended: AtomicBool,
    callback: Mutex<Option<EndCallback>>,
}

impl EndGuard {
    fn new(callback: EndCallback) -> Self {
        EndGuard {
            ended: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
        }
    }

    fn fire(&self) -> bool {
        if self.ended.swap(true, Ordering::AcqRel) {
            return false;
        }
        let callback = self.callback.lock().take();
        if let Some(cb) = callback {
            cb();
        }
        true
    }

    fn has_fired(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}

/// Latest waveform frame, written by the audio side and copied out by
/// subscribers.
struct WaveformSlot {
    frame: Mutex<Vec<f32>>,
    /// `false` reads as the empty "clear display" frame.
    live: AtomicBool,
    version: AtomicU64,
    notify: Notify,
}

impl WaveformSlot {
    fn new() -> Self {
        WaveformSlot {
            frame: Mutex::new(Vec::with_capacity(WAVEFORM_FRAME)),
            live: AtomicBool::new(false),
            version: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Copy the ring, oldest sample first. Skips the frame when a reader
    /// holds the slot.
    fn publish(&self, ring: &[f32], write: usize) {
        let Some(mut frame) = self.frame.try_lock() else {
            return;
        };
        frame.clear();
        frame.extend_from_slice(&ring[write..]);
        frame.extend_from_slice(&ring[..write]);
        drop(frame);
        self.live.store(true, Ordering::Release);
        self.bump();
    }

    fn clear(&self) {
        self.live.store(false, Ordering::Release);
        self.bump();
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }
}

/// Subscription to the waveform of the running session.
pub struct WaveformReceiver {
    slot: Arc<WaveformSlot>,
    seen: u64,
}

impl WaveformReceiver {
    /// The latest frame of [`WAVEFORM_FRAME`] samples, or an empty frame
    /// when playback stopped.
    pub fn latest(&self) -> Vec<f32> {
        if !self.slot.live.load(Ordering::Acquire) {
            return Vec::new();
        }
        self.slot.frame.lock().clone()
    }

    /// Like [`latest`](Self::latest), and marks the frame as seen.
    pub fn latest_and_update(&mut self) -> Vec<f32> {
        self.seen = self.slot.version.load(Ordering::Acquire);
        self.latest()
    }

    pub fn has_changed(&self) -> bool {
        self.slot.version.load(Ordering::Acquire) != self.seen
    }

    /// Wait for a frame newer than the last one seen.
    pub async fn changed(&mut self) {
        loop {
            let notified = self.slot.notify.notified();
            let version = self.slot.version.load(Ordering::Acquire);
            if version != self.seen {
                self.seen = version;
                return;
            }
            notified.await;
        }
    }
}

/// Ring of recent mono output, published at display rate.
struct WaveformTap {
    ring: Vec<f32>,
    write: usize,
    countdown: usize,
    interval: usize,
    slot: Arc<WaveformSlot>,
}

impl WaveformTap {
    fn new(sample_rate: u32, slot: Arc<WaveformSlot>) -> Self {
        let interval = (sample_rate / WAVEFORM_RATE_HZ).max(1) as usize;
        WaveformTap {
            ring: vec![0.0; WAVEFORM_FRAME],
            write: 0,
            countdown: interval,
            interval,
            slot,
        }
    }

    #[inline]
    fn push(&mut self, frame: &[f32]) {
        let mono = frame.iter().sum::<f32>() / frame.len().max(1) as f32;
        self.ring[self.write] = mono.clamp(-1.0, 1.0);
        self.write = (self.write + 1) % WAVEFORM_FRAME;
        self.countdown -= 1;
        if self.countdown == 0 {
            self.countdown = self.interval;
            self.slot.publish(&self.ring, self.write);
        }
    }
}

/// The running processing graph of a session.
pub struct LiveGraph {
    source: LiveSource,
    path: SignalPath,
    frame: Vec<f32>,
    source_done: bool,
    waveform: WaveformTap,
}

impl LiveGraph {
    /// Render one frame into `self.frame`; `false` once the tails are done.
    #[inline]
    fn render_frame(&mut self) -> bool {
        if self.path.is_finished() {
            return false;
        }
        if self.source_done || !self.source.next_frame(&mut self.frame) {
            self.source_done = true;
            self.frame.fill(0.0);
        }
        self.path.process_frame(&mut self.frame);
        self.waveform.push(&self.frame);
        true
    }
}

/// Pull handle for the audio output callback.
#[derive(Clone)]
pub struct PlaybackOutput {
    graph: Arc<Mutex<Option<LiveGraph>>>,
    guard: Arc<EndGuard>,
    waveform: Arc<WaveformSlot>,
    channels: usize,
    sample_rate: u32,
}

impl PlaybackOutput {
    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Fill `out` with interleaved frames. Returns `false`, with `out`
    /// zero-padded, once the session has ended or was stopped.
    pub fn fill(&self, out: &mut [f32]) -> bool {
        let finished = {
            let mut slot = self.graph.lock();
            let Some(graph) = slot.as_mut() else {
                out.fill(0.0);
                return false;
            };
            let mut finished = false;
            for frame in out.chunks_mut(self.channels) {
                if !finished && graph.render_frame() {
                    frame.copy_from_slice(&graph.frame[..frame.len()]);
                } else {
                    finished = true;
                    frame.fill(0.0);
                }
            }
            finished
        };

        if finished {
            // The spent graph stays parked; `Lab::stop` frees it
            if self.guard.fire() {
                tracing::info!("playback finished");
                self.waveform.clear();
            }
            return false;
        }
        true
    }
}

struct PlaybackSession {
    graph: Arc<Mutex<Option<LiveGraph>>>,
    guard: Arc<EndGuard>,
    started_with: Settings,
    reverb_signature: Option<String>,
    duration: f64,
    channels: usize,
    sample_rate: u32,
}

/// The lab engine: owns at most one playback session.
pub struct Lab {
    master_volume: f64,
    session: Option<PlaybackSession>,
    cache: ImpulseCache,
    backend: Arc<dyn StretchBackend>,
    waveform: Arc<WaveformSlot>,
}

impl Default for Lab {
    fn default() -> Self {
        Self::new()
    }
}

impl Lab {
    pub fn new() -> Self {
        Lab {
            master_volume: 1.0,
            session: None,
            cache: ImpulseCache::new(),
            backend: Arc::new(Wsola),
            waveform: Arc::new(WaveformSlot::new()),
        }
    }

    /// Use a different stretch library for `hq` sessions.
    pub fn with_backend(mut self, backend: Arc<dyn StretchBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn master_volume(&self) -> f64 {
        self.master_volume
    }

    /// Set the global volume; a running session glides to it.
    pub fn set_master_volume(&mut self, volume: f64) {
        self.master_volume = volume.clamp(0.0, 1.0);
        if let Some(session) = &self.session {
            if let Some(graph) = session.graph.lock().as_mut() {
                graph.path.set_master_volume(self.master_volume);
            }
        }
    }

    pub fn subscribe_waveform(&self) -> WaveformReceiver {
        WaveformReceiver {
            slot: Arc::clone(&self.waveform),
            seen: self.waveform.version.load(Ordering::Acquire),
        }
    }

    /// Start playing `buffer`, replacing any current session. Returns the
    /// predicted duration in seconds, tails included.
    ///
    /// In `hq` mode the stretch runs here, before audio starts, with the
    /// same backend and fallback as [`Renderer`](crate::Renderer).
    pub async fn play<F>(&mut self, buffer: Arc<AudioBuffer>, settings: &Settings, on_ended: F) -> f64
    where
        F: FnOnce() + Send + 'static,
    {
        self.stop();

        let sample_rate = buffer.sample_rate();
        let channels = buffer.channel_count();
        let trimmed = Arc::new(trim(&buffer, settings.offset_clamped()));
        let backend = Arc::clone(&self.backend);
        let source = LiveSource::prepare(trimmed, settings, backend.as_ref()).await;
        let base = source.total_frames();
        let total = planned_frames(settings, base, sample_rate);
        let path = SignalPath::new(
            settings,
            self.master_volume,
            channels,
            sample_rate,
            base,
            total,
            &mut self.cache,
            LIVE_RAMP_MS,
        );
        let reverb_signature = path.chain().reverb_signature().map(str::to_owned);
        let duration = total as f64 / sample_rate as f64;

        let graph = LiveGraph {
            source,
            path,
            frame: vec![0.0; channels],
            source_done: false,
            waveform: WaveformTap::new(sample_rate, Arc::clone(&self.waveform)),
        };

        tracing::info!(
            mode = ?settings.pitch_mode,
            channels,
            sample_rate,
            duration,
            "playback started"
        );
        self.session = Some(PlaybackSession {
            graph: Arc::new(Mutex::new(Some(graph))),
            guard: Arc::new(EndGuard::new(Box::new(on_ended))),
            started_with: settings.clone(),
            reverb_signature,
            duration,
            channels,
            sample_rate,
        });
        duration
    }

    /// Handle for the audio callback of the current session.
    pub fn output(&self) -> Option<PlaybackOutput> {
        self.session.as_ref().map(|s| PlaybackOutput {
            graph: Arc::clone(&s.graph),
            guard: Arc::clone(&s.guard),
            waveform: Arc::clone(&self.waveform),
            channels: s.channels,
            sample_rate: s.sample_rate,
        })
    }

    pub fn is_playing(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.guard.has_fired())
    }

    pub fn predicted_duration(&self) -> Option<f64> {
        self.session.as_ref().map(|s| s.duration)
    }

    /// Effect order of the running graph.
    pub fn chain_order(&self) -> Option<Vec<FxKind>> {
        let session = self.session.as_ref()?;
        let graph = session.graph.lock();
        graph.as_ref().map(|g| g.path.chain().kinds())
    }

    /// Retarget the running graph. Effect order, pitch, tempo, offset and
    /// fades are fixed at [`play`](Self::play) and ignored here.
    pub fn update_live_settings(&mut self, settings: &Settings) {
        let Some(session) = &mut self.session else {
            return;
        };
        let fixed = &session.started_with;
        if settings.fx_order != fixed.fx_order {
            tracing::debug!("fxOrder change takes effect on next play");
        }
        if settings.pitch_mode != fixed.pitch_mode
            || settings.pitch_semitones != fixed.pitch_semitones
            || settings.tempo != fixed.tempo
            || settings.offset != fixed.offset
        {
            tracing::debug!("pitch, tempo and offset changes take effect on next play");
        }

        // Impulse synthesis and FFT partitioning stay outside the lock
        let reverb = ReverbParams::from_settings(settings);
        let bank = match &session.reverb_signature {
            Some(current) if *current != reverb.signature() => {
                let ir = self.cache.get(&reverb, session.channels, session.sample_rate);
                session.reverb_signature = Some(reverb.signature());
                Some(convolver_bank(&ir))
            }
            _ => None,
        };

        if let Some(graph) = session.graph.lock().as_mut() {
            graph.path.apply_live(settings, bank);
        }
    }

    /// End the session and free its graph. Safe to call repeatedly or with
    /// nothing playing.
    pub fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let graph = session.graph.lock().take();
        if let Some(mut graph) = graph {
            graph.path.disconnect();
        }
        if session.guard.fire() {
            tracing::info!("playback stopped");
        }
        self.waveform.clear();
    }
}

impl Drop for Lab {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::Renderer;
    use crate::settings::{FxOrder, PitchMode};
    use std::sync::atomic::AtomicUsize;

    const SR: u32 = 8000;

    fn buffer(frames: usize, channels: usize) -> Arc<AudioBuffer> {
        let ch: Vec<f32> = (0..frames).map(|i| ((i % 40) as f32 / 20.0 - 1.0) * 0.5).collect();
        Arc::new(AudioBuffer::new(vec![ch; channels], SR).unwrap())
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn drain(output: &PlaybackOutput) -> Vec<f32> {
        let mut all = Vec::new();
        let mut block = vec![0.0; 256 * output.channels()];
        loop {
            let more = output.fill(&mut block);
            all.extend_from_slice(&block);
            if !more {
                return all;
            }
        }
    }

    #[test]
    fn stop_without_session_is_noop() {
        let mut lab = Lab::new();
        lab.stop();
        lab.stop();
        assert!(!lab.is_playing());
        assert!(lab.output().is_none());
    }

    #[tokio::test]
    async fn stop_twice_fires_once() {
        let mut lab = Lab::new();
        let (count, cb) = counter();
        lab.play(buffer(4000, 1), &Settings::default(), cb).await;
        assert!(lab.is_playing());
        lab.stop();
        lab.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!lab.is_playing());
    }

    #[tokio::test]
    async fn natural_completion_fires_once() {
        let mut lab = Lab::new();
        let (count, cb) = counter();
        let duration = lab.play(buffer(1000, 2), &Settings::default(), cb).await;
        assert!((duration - 0.125).abs() < 1e-9);

        let output = lab.output().unwrap();
        let pulled = drain(&output);
        assert!(pulled.len() >= 2000);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!lab.is_playing());
        assert!(!output.fill(&mut [0.0; 4]));

        lab.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn play_replaces_previous_session() {
        let mut lab = Lab::new();
        let (first, cb1) = counter();
        let (second, cb2) = counter();
        lab.play(buffer(4000, 1), &Settings::default(), cb1).await;
        let stale = lab.output().unwrap();
        lab.play(buffer(4000, 1), &Settings::default(), cb2).await;
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert!(!stale.fill(&mut [0.0; 8]));
        assert!(lab.is_playing());
    }

    #[tokio::test]
    async fn waveform_frames_and_clear_on_stop() {
        let mut lab = Lab::new();
        let mut rx = lab.subscribe_waveform();
        lab.play(buffer(8000, 1), &Settings::default(), || {}).await;
        let output = lab.output().unwrap();
        let mut block = vec![0.0; SR as usize / 30];
        output.fill(&mut block);
        assert!(rx.has_changed());
        let frame = rx.latest_and_update();
        assert_eq!(frame.len(), WAVEFORM_FRAME);
        assert!(frame.iter().all(|s| (-1.0..=1.0).contains(s)));
        assert!(!rx.has_changed());
        lab.stop();
        assert!(rx.has_changed());
        assert!(rx.latest().is_empty());
    }

    #[tokio::test]
    async fn live_update_keeps_the_graph() {
        let mut lab = Lab::new();
        let settings = Settings::default();
        lab.play(buffer(16000, 1), &settings, || {}).await;
        let output = lab.output().unwrap();
        let mut block = vec![0.0; 512];
        output.fill(&mut block);

        let muted = Settings {
            output_gain: 0.0,
            reverb_enabled: true,
            reverb_seconds: 0.3,
            fx_order: FxOrder::new(vec![FxKind::Delay]).unwrap(),
            ..settings.clone()
        };
        lab.update_live_settings(&muted);
        assert_eq!(lab.chain_order().unwrap(), FxKind::ALL.to_vec());
        assert!(lab.is_playing());

        for _ in 0..10 {
            output.fill(&mut block);
        }
        assert!(block.iter().all(|s| s.abs() < 1e-3), "gain did not reach zero");
    }

    #[tokio::test]
    async fn reverb_reimpulse_on_live_change() {
        let mut lab = Lab::new();
        let settings = Settings {
            reverb_enabled: true,
            reverb_seconds: 0.2,
            ..Settings::default()
        };
        lab.play(buffer(8000, 2), &settings, || {}).await;
        lab.update_live_settings(&Settings {
            reverb_seconds: 0.4,
            ..settings.clone()
        });
        let session = lab.session.as_ref().unwrap();
        let expected = ReverbParams::from_settings(&Settings {
            reverb_seconds: 0.4,
            ..settings
        })
        .signature();
        assert_eq!(session.reverb_signature.as_deref(), Some(expected.as_str()));
        let graph = session.graph.lock();
        assert_eq!(graph.as_ref().unwrap().path.chain().reverb_signature(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn live_matches_offline_render() {
        let settings = Settings {
            pitch_mode: PitchMode::Tape,
            pitch_semitones: -5.0,
            highpass_enabled: true,
            highpass_frequency: 120.0,
            delay_enabled: true,
            delay_time: 0.05,
            reverb_enabled: true,
            reverb_seconds: 0.1,
            fade_in: 0.01,
            fade_out: 0.02,
            ..Settings::default()
        };
        let source = buffer(2000, 2);
        let offline = Renderer::new().render(&source, &settings).await.unwrap();

        let mut lab = Lab::new();
        let duration = lab.play(Arc::clone(&source), &settings, || {}).await;
        assert!((duration - offline.duration()).abs() < 1e-9);

        let live = drain(&lab.output().unwrap());
        for i in 0..offline.len() {
            for ch in 0..2 {
                let a = live[i * 2 + ch];
                let b = offline.channel(ch)[i];
                assert!((a - b).abs() < 1e-5, "frame {i} ch {ch}: live {a} offline {b}");
            }
        }
    }

    #[tokio::test]
    async fn granular_session_predicts_stretched_length() {
        let mut lab = Lab::new();
        let settings = Settings {
            pitch_mode: PitchMode::Granular,
            tempo: 0.5,
            ..Settings::default()
        };
        let duration = lab.play(buffer(4000, 1), &settings, || {}).await;
        assert!((duration - 1.0).abs() < 1e-9);
        let frames = drain(&lab.output().unwrap());
        assert!(frames.len() >= 8000);
    }

    #[tokio::test]
    async fn live_hq_matches_offline_render() {
        let settings = Settings {
            pitch_mode: PitchMode::Hq,
            pitch_semitones: 3.0,
            tempo: 0.8,
            lowpass_enabled: true,
            lowpass_frequency: 2500.0,
            fade_out: 0.05,
            ..Settings::default()
        };
        let ch: Vec<f32> = (0..16000)
            .map(|i| (2.0 * std::f32::consts::PI * 220.0 * i as f32 / SR as f32).sin() * 0.5)
            .collect();
        let source = Arc::new(AudioBuffer::new(vec![ch], SR).unwrap());
        let offline = Renderer::new().render(&source, &settings).await.unwrap();

        let mut lab = Lab::new();
        let duration = lab.play(Arc::clone(&source), &settings, || {}).await;
        assert!((duration - offline.duration()).abs() < 1e-9);

        let live = drain(&lab.output().unwrap());
        for (i, &b) in offline.channel(0).iter().enumerate() {
            assert!((live[i] - b).abs() < 1e-5, "frame {i}: live {} offline {b}", live[i]);
        }
    }

    #[tokio::test]
    async fn fill_never_waits_on_a_waveform_reader() {
        let mut lab = Lab::new();
        let rx = lab.subscribe_waveform();
        lab.play(buffer(16000, 1), &Settings::default(), || {}).await;
        let output = lab.output().unwrap();

        // A reader in the middle of copying a frame out
        let reading = rx.slot.frame.lock();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let audio = std::thread::spawn(move || {
            let mut block = [0.0; 512];
            output.fill(&mut block);
            let _ = done_tx.send(());
        });
        let finished = done_rx.recv_timeout(std::time::Duration::from_secs(2)).is_ok();
        drop(reading);
        audio.join().unwrap();
        assert!(finished, "fill blocked while the waveform slot was held");

        // Control side is still reachable afterwards
        lab.set_master_volume(0.5);
        lab.stop();
        assert!(rx.latest().is_empty());
    }

    #[tokio::test]
    async fn stop_racing_natural_completion_fires_once() {
        let mut lab = Lab::new();
        for i in 0..200 {
            let (count, cb) = counter();
            lab.play(buffer(300 + i % 7, 1), &Settings::default(), cb).await;
            let output = lab.output().unwrap();
            let audio = std::thread::spawn(move || {
                let mut block = [0.0; 64];
                while output.fill(&mut block) {}
            });
            for _ in 0..3 {
                lab.stop();
                std::thread::yield_now();
            }
            audio.join().unwrap();
            lab.stop();
            assert_eq!(count.load(Ordering::SeqCst), 1, "iteration {i}");
        }
    }

    #[tokio::test]
    async fn finished_graph_is_freed_by_the_control_side() {
        let mut lab = Lab::new();
        lab.play(buffer(500, 1), &Settings::default(), || {}).await;
        let output = lab.output().unwrap();
        drain(&output);
        assert!(!lab.is_playing());
        // Still parked after the audio side saw the end
        assert!(lab.session.as_ref().unwrap().graph.lock().is_some());
        lab.stop();
        assert!(output.graph.lock().is_none());
    }
}
