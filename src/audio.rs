use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{info, warn};

use crate::nes::apu::to_pcm8;

/// Unsigned 8-bit PCM, midpoint 128.
type PcmQueue = Arc<Mutex<VecDeque<u8>>>;

const SILENCE: u8 = 0x80;

/// cpal output fed from a bounded queue of APU samples. Overflow drops the
/// oldest samples so latency stays bounded.
pub struct AudioOutput {
    queue: PcmQueue,
    _stream: cpal::Stream,
    sample_rate: u32,
    max_queue_samples: usize,
}

impl AudioOutput {
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default audio output device"))?;
        let supported = device
            .default_output_config()
            .context("failed to query default audio config")?;

        let stream_config: cpal::StreamConfig = supported.config();
        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;
        let max_queue_samples = ((sample_rate as usize) * 96) / 1000;
        let queue: PcmQueue = Arc::new(Mutex::new(VecDeque::with_capacity(max_queue_samples)));

        let err_fn = |err| warn!("audio stream error: {err}");

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => {
                let queue = Arc::clone(&queue);
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _| fill_output(data, channels, &queue, pcm_to_f32),
                    err_fn,
                    None,
                )?
            }
            cpal::SampleFormat::I16 => {
                let queue = Arc::clone(&queue);
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _| fill_output(data, channels, &queue, pcm_to_i16),
                    err_fn,
                    None,
                )?
            }
            cpal::SampleFormat::U16 => {
                let queue = Arc::clone(&queue);
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [u16], _| fill_output(data, channels, &queue, pcm_to_u16),
                    err_fn,
                    None,
                )?
            }
            other => {
                return Err(anyhow!("unsupported audio sample format: {other:?}"));
            }
        };

        stream
            .play()
            .context("failed to start audio output stream")?;
        info!(sample_rate, channels, "audio output started");

        Ok(Self {
            queue,
            _stream: stream,
            sample_rate,
            max_queue_samples,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Queues mixed APU samples in `[0, 1]`.
    pub fn push_samples(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }

        let Ok(mut queue) = self.queue.lock() else {
            return;
        };
        enqueue_bounded(&mut queue, samples, self.max_queue_samples);
    }

    pub fn queued_samples(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }
}

fn enqueue_bounded(queue: &mut VecDeque<u8>, samples: &[f32], max_len: usize) {
    let future_len = queue.len().saturating_add(samples.len());
    if future_len > max_len {
        let drop_count = (future_len - max_len).min(queue.len());
        queue.drain(..drop_count);
    }
    queue.extend(samples.iter().map(|&s| to_pcm8(s)));
}

fn next_sample(queue: &PcmQueue) -> u8 {
    queue
        .lock()
        .ok()
        .and_then(|mut q| q.pop_front())
        .unwrap_or(SILENCE)
}

fn fill_output<T: Copy>(data: &mut [T], channels: usize, queue: &PcmQueue, convert: fn(u8) -> T) {
    for frame in data.chunks_mut(channels) {
        let sample = convert(next_sample(queue));
        frame.fill(sample);
    }
}

fn pcm_to_f32(sample: u8) -> f32 {
    (sample as f32 - 128.0) / 128.0
}

fn pcm_to_i16(sample: u8) -> i16 {
    ((sample as i16) - 128) << 8
}

fn pcm_to_u16(sample: u8) -> u16 {
    (sample as u16) << 8
}
