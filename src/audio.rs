//! Microphone capture through cpal, exposed as a [`LocalMediaPort`].
//!
//! Samples are downmixed to mono, decimated to 8 kHz and G.711 µ-law encoded
//! into 20 ms PCMU frames, which every codec stack accepts without negotiation
//! surprises. A disabled track keeps sending silence so RTP timing stays intact.

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, FromSample, Sample, SampleFormat, SizedSample};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use webrtc::media::Sample as MediaSample;

use crate::error::MediaAccessError;
use crate::media::{LocalMediaPort, LocalStream, LocalTrack, MediaConstraints};

const PCMU_RATE: u32 = 8000;
const FRAME_SAMPLES: usize = 160;
const FRAME_DURATION: Duration = Duration::from_millis(20);
const ULAW_SILENCE: u8 = 0xFF;

/// Local media from the default input device. Audio only.
pub struct CpalMediaPort {
    stream_id: String,
}

impl CpalMediaPort {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }
}

#[async_trait]
impl LocalMediaPort for CpalMediaPort {
    async fn get_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, MediaAccessError> {
        if constraints.video {
            return Err(MediaAccessError::Unsupported("camera".to_owned()));
        }
        if !constraints.audio {
            return Err(MediaAccessError::DeviceUnavailable("media".to_owned()));
        }

        let track = LocalTrack::audio(
            &format!("audio-{:08x}", rand::random::<u32>()),
            &self.stream_id,
        );
        let capture = AudioCapture::start(track.clone()).await?;
        Ok(LocalStream::new(self.stream_id.clone(), vec![track]).with_guard(Arc::new(capture)))
    }

    async fn get_display_media(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<LocalStream, MediaAccessError> {
        Err(MediaAccessError::Unsupported("display".to_owned()))
    }
}

/// Running capture. Dropping it stops the input stream.
pub struct AudioCapture {
    _stop: oneshot::Sender<()>,
}

impl AudioCapture {
    pub async fn start(track: LocalTrack) -> Result<Self, MediaAccessError> {
        let (samples_tx, samples_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        // cpal streams are not Send on every host, so the stream lives and dies
        // on its own thread.
        std::thread::Builder::new()
            .name("mic-capture".to_owned())
            .spawn(move || {
                let stream = match open_input(samples_tx) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = stop_rx.blocking_recv();
                drop(stream);
                debug!("microphone capture stopped");
            })
            .map_err(|e| MediaAccessError::Stream(e.to_string()))?;

        let sample_rate = ready_rx
            .await
            .map_err(|_| MediaAccessError::Stream("capture thread exited".to_owned()))??;
        info!(sample_rate, "microphone capture started");

        tokio::spawn(encode_loop(track, sample_rate, samples_rx));
        Ok(Self { _stop: stop_tx })
    }
}

fn open_input(
    samples: mpsc::UnboundedSender<Vec<f32>>,
) -> Result<(cpal::Stream, u32), MediaAccessError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| MediaAccessError::DeviceUnavailable("microphone".to_owned()))?;

    let supported = device
        .default_input_config()
        .map_err(|e| MediaAccessError::Stream(e.to_string()))?;
    let sample_rate = supported.sample_rate().0;
    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    debug!(?config, ?format, "input config");

    let stream = match format {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &config, samples),
        SampleFormat::I16 => build_input_stream::<i16>(&device, &config, samples),
        SampleFormat::U16 => build_input_stream::<u16>(&device, &config, samples),
        other => return Err(MediaAccessError::Stream(format!("unsupported sample format {:?}", other))),
    }
    .map_err(|e| match e {
        BuildStreamError::DeviceNotAvailable => {
            MediaAccessError::DeviceUnavailable("microphone".to_owned())
        }
        other => MediaAccessError::Stream(other.to_string()),
    })?;

    stream
        .play()
        .map_err(|e| MediaAccessError::Stream(e.to_string()))?;
    Ok((stream, sample_rate))
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    samples: mpsc::UnboundedSender<Vec<f32>>,
) -> Result<cpal::Stream, BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels).max(1);
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mono: Vec<f32> = data
                .chunks(channels)
                .map(|frame| {
                    frame.iter().map(|s| s.to_sample::<f32>()).sum::<f32>() / frame.len() as f32
                })
                .collect();
            let _ = samples.send(mono);
        },
        |err| warn!(error = %err, "input stream error"),
        None,
    )
}

async fn encode_loop(
    track: LocalTrack,
    input_rate: u32,
    mut samples: mpsc::UnboundedReceiver<Vec<f32>>,
) {
    let mut encoder = PcmuEncoder::new(input_rate);
    let rtp_track = track.rtp_track();
    while let Some(chunk) = samples.recv().await {
        for frame in encoder.push(&chunk) {
            let data = if track.is_enabled() {
                frame
            } else {
                vec![ULAW_SILENCE; FRAME_SAMPLES]
            };
            let sample = MediaSample {
                data: Bytes::from(data),
                duration: FRAME_DURATION,
                ..Default::default()
            };
            if let Err(e) = rtp_track.write_sample(&sample).await {
                debug!(error = %e, "dropping audio frame");
            }
        }
    }
}

/// Mono f32 at any rate in, 20 ms µ-law frames at 8 kHz out.
struct PcmuEncoder {
    step: f64,
    phase: f64,
    acc: f32,
    count: u32,
    pending: Vec<u8>,
}

impl PcmuEncoder {
    fn new(input_rate: u32) -> Self {
        Self {
            step: (f64::from(input_rate) / f64::from(PCMU_RATE)).max(1.0),
            phase: 0.0,
            acc: 0.0,
            count: 0,
            pending: Vec::with_capacity(FRAME_SAMPLES),
        }
    }

    fn push(&mut self, input: &[f32]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &s in input {
            self.acc += s;
            self.count += 1;
            self.phase += 1.0;
            if self.phase < self.step {
                continue;
            }
            self.phase -= self.step;
            let mean = self.acc / self.count as f32;
            self.acc = 0.0;
            self.count = 0;

            let pcm = (mean.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
            self.pending.push(linear_to_ulaw(pcm));
            if self.pending.len() == FRAME_SAMPLES {
                frames.push(std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(FRAME_SAMPLES),
                ));
            }
        }
        frames
    }
}

/// G.711 µ-law.
fn linear_to_ulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    let mut pcm = i32::from(sample);
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}
