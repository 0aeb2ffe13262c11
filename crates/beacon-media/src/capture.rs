//! Microphone capture and speaker playback.
//!
//! The capture device is acquired when a call session opens and released
//! on every teardown path. Mute replaces captured samples with silence
//! instead of pausing the stream, so playback cadence is preserved and
//! unmuting never renegotiates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::MediaError;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size_ms: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            frame_size_ms: 20,
        }
    }
}

impl CaptureConfig {
    pub fn frame_size_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_size_ms as usize) / 1000
    }
}

/// Exclusive handle on the default input device for one call.
pub struct AudioCapture {
    muted: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
    frames: Option<tokio::sync::mpsc::Receiver<Vec<f32>>>,
}

impl AudioCapture {
    /// Acquire the default microphone and start delivering fixed-size
    /// frames. Fails with [`MediaError::NoInputDevice`] when no device is
    /// available (including permission denial on platforms that hide the
    /// device in that case).
    pub fn open(config: &CaptureConfig) -> Result<Self, MediaError> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(MediaError::NoInputDevice)?;

        info!(device = ?device.name(), "Using input device");

        let stream_config = cpal::StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (frame_tx, frame_rx) = tokio::sync::mpsc::channel::<Vec<f32>>(32);
        let frame_size = config.frame_size_samples();
        let mut buffer = Vec::with_capacity(frame_size);
        let muted = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicBool::new(true));

        let muted_cb = muted.clone();
        let active_cb = active.clone();
        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    if !active_cb.load(Ordering::Relaxed) {
                        return;
                    }
                    if muted_cb.load(Ordering::Relaxed) {
                        // Silence while muted keeps the frame clock running
                        buffer.extend(std::iter::repeat(0.0f32).take(data.len()));
                    } else {
                        buffer.extend_from_slice(data);
                    }
                    while buffer.len() >= frame_size {
                        let frame: Vec<f32> = buffer.drain(..frame_size).collect();
                        if frame_tx.try_send(frame).is_err() {
                            warn!("Audio frame channel full, dropping frame");
                        }
                    }
                },
                move |err| {
                    error!("Audio input error: {err}");
                },
                None,
            )
            .map_err(|e| MediaError::Stream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MediaError::Stream(e.to_string()))?;

        // Keep stream alive (released via active flag — callback becomes a no-op)
        std::mem::forget(stream);

        debug!("Audio capture started");
        Ok(Self {
            muted,
            active,
            frames: Some(frame_rx),
        })
    }

    /// Take the frame receiver. Yields `None` on the second call.
    pub fn take_frames(&mut self) -> Option<tokio::sync::mpsc::Receiver<Vec<f32>>> {
        self.frames.take()
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
        debug!(muted, "Capture mute state changed");
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Release the device. Idempotent.
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.muted.store(false, Ordering::SeqCst);
            debug!("Audio capture stopped");
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Playback sink for the remote peer's audio. Autoplays frames as they
/// arrive and pads with silence when the channel runs dry.
pub struct AudioPlayback {
    active: Arc<AtomicBool>,
}

impl AudioPlayback {
    pub fn open(
        config: &CaptureConfig,
        mut frame_rx: tokio::sync::mpsc::Receiver<Vec<f32>>,
    ) -> Result<Self, MediaError> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(MediaError::NoOutputDevice)?;

        info!(device = ?device.name(), "Using output device");

        let stream_config = cpal::StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (playback_tx, playback_rx) = std::sync::mpsc::channel::<Vec<f32>>();
        let active = Arc::new(AtomicBool::new(true));

        // Bridge the tokio channel to a std channel for the audio callback
        let active_bridge = active.clone();
        tokio::spawn(async move {
            while active_bridge.load(Ordering::Relaxed) {
                match frame_rx.recv().await {
                    Some(frame) => {
                        if playback_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        });

        let mut play_buffer: std::collections::VecDeque<f32> = std::collections::VecDeque::new();
        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    while let Ok(frame) = playback_rx.try_recv() {
                        play_buffer.extend(frame.iter());
                    }
                    for sample in data.iter_mut() {
                        *sample = play_buffer.pop_front().unwrap_or(0.0);
                    }
                },
                move |err| {
                    error!("Audio output error: {err}");
                },
                None,
            )
            .map_err(|e| MediaError::Stream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MediaError::Stream(e.to_string()))?;

        std::mem::forget(stream);

        debug!("Audio playback started");
        Ok(Self { active })
    }

    /// Detach the sink. Idempotent.
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            debug!("Audio playback stopped");
        }
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}
