//! Local Media Source - Mikrofon Capture und Playback
//!
//! Verwendet cpal für Cross-Platform Audio I/O. Aufgenommenes Audio wird
//! auf 8kHz Mono gebracht, mu-law kodiert und als 20ms-Frames an alle
//! angehängten Peer-Verbindungen verteilt. Dekodiertes Remote-Audio
//! landet im Playback-Ring-Buffer.

use super::g711;
use super::MediaError;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (8kHz, vorgegeben durch G.711)
pub const SAMPLE_RATE: u32 = 8000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 8kHz = 160 samples)
pub const FRAME_SIZE: usize = 160;

/// Buffer Size für Audio-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// MEDIA SOURCE
// ============================================================================

/// Lokale Audioquelle und -senke
///
/// Note: Stream ist nicht Send, daher wrappen wir in Send-fähige Container
pub struct MediaSource {
    input_device: Device,
    output_device: Option<Device>,
    input_stream: Option<Stream>,
    output_stream: Option<Stream>,

    /// Ring-Buffer für aufgenommenes Audio (Raw PCM, 8kHz)
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Ring-Buffer für zu spielendes Audio (decoded PCM, 8kHz)
    playback_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Verteilt mu-law kodierte 20ms-Frames an alle Verbindungen
    frame_tx: broadcast::Sender<Bytes>,

    /// Mute-Status
    is_muted: Arc<Mutex<bool>>,

    /// Audio Level (0.0 - 1.0) für Anzeige
    input_level: Arc<Mutex<f32>>,
    output_level: Arc<Mutex<f32>>,

    pump: Option<tokio::task::JoinHandle<()>>,
}

// MediaSource ist wegen Stream nicht automatisch Send
unsafe impl Send for MediaSource {}

impl MediaSource {
    /// Öffnet die Standard-Audiogeräte.
    ///
    /// Ohne Eingabegerät kann kein Anruf aufgebaut werden, daher ist
    /// das ein harter Fehler. Fehlendes Ausgabegerät wird toleriert.
    pub fn acquire() -> Result<Self, MediaError> {
        let host = cpal::default_host();

        let input_device = host
            .default_input_device()
            .ok_or_else(|| MediaError::Acquisition("no audio input device found".into()))?;

        let output_device = host.default_output_device();
        if output_device.is_none() {
            tracing::warn!("No audio output device found, remote audio will be discarded");
        }

        let (frame_tx, _) = broadcast::channel(32);

        tracing::info!(
            "MediaSource acquired: {}Hz, {} channel(s)",
            SAMPLE_RATE,
            CHANNELS
        );

        Ok(Self {
            input_device,
            output_device,
            input_stream: None,
            output_stream: None,
            capture_buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            playback_buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            frame_tx,
            is_muted: Arc::new(Mutex::new(false)),
            input_level: Arc::new(Mutex::new(0.0)),
            output_level: Arc::new(Mutex::new(0.0)),
            pump: None,
        })
    }

    /// Startet Capture, Playback und den Frame-Pump
    pub fn start(&mut self) -> Result<(), MediaError> {
        self.start_capture()?;
        if let Err(e) = self.start_playback() {
            tracing::warn!("Audio playback unavailable: {}", e);
        }
        self.start_pump();
        Ok(())
    }

    /// Stoppt alle Audio-Streams
    pub fn stop(&mut self) {
        self.input_stream = None;
        self.output_stream = None;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        tracing::info!("Audio streams stopped");
    }

    /// Empfänger für kodierte 20ms-Frames (ein Receiver pro Verbindung)
    pub fn subscribe_frames(&self) -> broadcast::Receiver<Bytes> {
        self.frame_tx.subscribe()
    }

    /// Schreibt dekodierte Remote-Samples in den Playback-Buffer
    pub fn write_playback(&self, samples: &[f32]) {
        let mut buffer = self.playback_buffer.lock();
        for sample in samples {
            let _ = buffer.try_push(*sample);
        }
    }

    /// Setzt den Mute-Status
    pub fn set_muted(&self, muted: bool) {
        *self.is_muted.lock() = muted;
        tracing::debug!("Audio muted: {}", muted);
    }

    /// Gibt den Mute-Status zurück
    pub fn is_muted(&self) -> bool {
        *self.is_muted.lock()
    }

    /// Gibt die Audio-Levels zurück (input, output)
    pub fn levels(&self) -> (f32, f32) {
        (*self.input_level.lock(), *self.output_level.lock())
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn start_capture(&mut self) -> Result<(), MediaError> {
        let config = Self::best_config(
            self.input_device
                .supported_input_configs()
                .map_err(|e| MediaError::Acquisition(e.to_string()))?
                .collect(),
        )?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let capture_buffer = Arc::clone(&self.capture_buffer);
        let is_muted = Arc::clone(&self.is_muted);
        let input_level = Arc::clone(&self.input_level);
        let source_rate = config.sample_rate.0;
        let source_channels = config.channels as usize;

        let stream = self
            .input_device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let rms: f32 =
                        (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    *input_level.lock() = rms.min(1.0);

                    if *is_muted.lock() {
                        return;
                    }

                    // Auf Mono reduzieren (erster Kanal)
                    let mono: Vec<f32> = data
                        .iter()
                        .step_by(source_channels)
                        .copied()
                        .collect();

                    let samples = resample(&mono, source_rate, SAMPLE_RATE);

                    let mut buffer = capture_buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| MediaError::Acquisition(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MediaError::Acquisition(e.to_string()))?;

        self.input_stream = Some(stream);
        Ok(())
    }

    fn start_playback(&mut self) -> Result<(), MediaError> {
        let device = self
            .output_device
            .as_ref()
            .ok_or_else(|| MediaError::Acquisition("no audio output device".into()))?;

        let config = Self::best_config(
            device
                .supported_output_configs()
                .map_err(|e| MediaError::Acquisition(e.to_string()))?
                .collect(),
        )?;

        tracing::info!(
            "Starting audio playback: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let playback_buffer = Arc::clone(&self.playback_buffer);
        let output_level = Arc::clone(&self.output_level);
        let target_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    let ratio = SAMPLE_RATE as f32 / target_rate as f32;
                    let mut level_sum = 0.0f32;

                    let mut buffer = playback_buffer.lock();
                    let mut last = 0.0f32;
                    let mut consumed = 0usize;

                    for i in 0..frames {
                        // Nächstes Quellsample erst holen wenn der
                        // Resampling-Index es erreicht
                        let want = (i as f32 * ratio) as usize;
                        while consumed <= want {
                            last = buffer.try_pop().unwrap_or(0.0);
                            consumed += 1;
                        }

                        level_sum += last.abs();
                        for c in 0..channels {
                            if let Some(s) = data.get_mut(i * channels + c) {
                                *s = last;
                            }
                        }
                    }

                    if frames > 0 {
                        *output_level.lock() = (level_sum / frames as f32).min(1.0);
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| MediaError::Acquisition(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MediaError::Acquisition(e.to_string()))?;

        self.output_stream = Some(stream);
        Ok(())
    }

    /// Liest alle 20ms einen Frame aus dem Capture-Buffer, kodiert ihn
    /// und verteilt ihn an die angehängten Verbindungen.
    fn start_pump(&mut self) {
        let capture_buffer = Arc::clone(&self.capture_buffer);
        let frame_tx = self.frame_tx.clone();

        self.pump = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(20));
            loop {
                interval.tick().await;

                let frame = {
                    let mut buffer = capture_buffer.lock();
                    if buffer.occupied_len() < FRAME_SIZE {
                        continue;
                    }
                    let mut frame = Vec::with_capacity(FRAME_SIZE);
                    for _ in 0..FRAME_SIZE {
                        if let Some(sample) = buffer.try_pop() {
                            frame.push(sample);
                        }
                    }
                    frame
                };

                let payload = Bytes::from(g711::encode_frame(&frame));
                // Kein Abonnent ist kein Fehler (noch keine Verbindung)
                let _ = frame_tx.send(payload);
            }
        }));
    }

    /// Wählt die beste Stream-Konfiguration: 8kHz F32 wenn möglich,
    /// sonst beste F32-Konfiguration. Die Stream-Callbacks arbeiten
    /// mit f32-Samples, andere Formate werden nicht bedient.
    fn best_config(
        configs: Vec<SupportedStreamConfigRange>,
    ) -> Result<StreamConfig, MediaError> {
        let target_rate = cpal::SampleRate(SAMPLE_RATE);

        for config in &configs {
            if config.min_sample_rate() <= target_rate
                && config.max_sample_rate() >= target_rate
                && config.sample_format() == SampleFormat::F32
            {
                return Ok(config.with_sample_rate(target_rate).into());
            }
        }

        for config in &configs {
            if config.sample_format() == SampleFormat::F32 {
                return Ok(config.with_max_sample_rate().into());
            }
        }

        Err(MediaError::Acquisition(
            "no f32 audio configuration available".to_string(),
        ))
    }
}

impl Drop for MediaSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Einfaches Linear-Resampling
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return samples.to_vec();
    }
    let ratio = to_rate as f32 / from_rate as f32;
    let new_len = (samples.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = samples.get(idx).copied().unwrap_or(0.0);
            let s2 = samples.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}
