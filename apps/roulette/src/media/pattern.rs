use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{CapturePipeline, KeyframeFlag, RawFrame, VideoEncoder, VideoSender};

#[derive(Debug, Clone, Copy)]
pub struct PatternConfig {
    pub width: u16,
    pub height: u16,
    pub fps: u32,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 36,
            fps: 15,
        }
    }
}

#[derive(Default)]
struct Shared {
    keyframe: KeyframeFlag,
    output: Mutex<Option<VideoSender>>,
}

/// Synthetic camera: renders a moving gradient, encodes it and writes it to
/// whatever output is currently attached.
#[derive(Clone, Default)]
pub struct TestPatternCapture {
    shared: Arc<Shared>,
}

impl TestPatternCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns the frame loop; it runs until `cancel` fires.
    pub fn start(
        &self,
        encoder: Box<dyn VideoEncoder>,
        config: PatternConfig,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(run(Arc::clone(&self.shared), encoder, config, cancel))
    }
}

impl CapturePipeline for TestPatternCapture {
    fn request_keyframe(&self) {
        self.shared.keyframe.request();
    }

    fn set_output(&self, output: Option<VideoSender>) {
        if output.is_some() {
            // A new receiver needs something to decode from.
            self.shared.keyframe.request();
        }
        *self.shared.output.lock() = output;
    }
}

pub fn render(index: u64, width: u16, height: u16) -> RawFrame {
    let mut frame = RawFrame::blank(width, height);
    let shift = (index % 256) as usize;
    for y in 0..height as usize {
        for x in 0..width as usize {
            frame.luma[y * width as usize + x] = ((x + y + shift) * 4 % 256) as u8;
        }
    }
    frame
}

async fn run(
    shared: Arc<Shared>,
    mut encoder: Box<dyn VideoEncoder>,
    config: PatternConfig,
    cancel: CancellationToken,
) {
    let frame_duration = Duration::from_secs(1) / config.fps.max(1);
    let mut ticker = tokio::time::interval(frame_duration);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let started = Instant::now();
    let mut index = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(output) = shared.output.lock().clone() else {
            continue;
        };
        let raw = render(index, config.width, config.height);
        index += 1;
        let force = shared.keyframe.take();
        match encoder.encode(&raw, started.elapsed(), force) {
            Ok(data) => {
                trace!(bytes = data.len(), keyframe = force, "captured frame");
                if let Err(err) = output.write_frame(data, frame_duration).await {
                    debug!(error = %err, "frame write failed");
                }
            }
            Err(err) => warn!(error = %err, "encode failed"),
        }
    }
    debug!(frames = index, "test pattern stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::raw::RawLumaEncoder;
    use crate::media::VideoSink;
    use crate::session::SessionError;
    use async_trait::async_trait;
    use bytes::Bytes;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Bytes>>);

    #[async_trait]
    impl VideoSink for Recorder {
        async fn write_frame(&self, data: Bytes, _duration: Duration) -> Result<(), SessionError> {
            self.0.lock().push(data);
            Ok(())
        }
    }

    fn is_key(frame: &Bytes) -> bool {
        frame[1] & 0x01 != 0
    }

    #[tokio::test(start_paused = true)]
    async fn frames_flow_only_while_output_attached() {
        let capture = TestPatternCapture::new();
        let cancel = CancellationToken::new();
        let task = capture.start(
            Box::new(RawLumaEncoder::new(1_000)),
            PatternConfig::default(),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        let recorder = Arc::new(Recorder::default());
        capture.set_output(Some(recorder.clone()));
        tokio::time::sleep(Duration::from_millis(500)).await;

        let frames = recorder.0.lock().clone();
        assert!(frames.len() >= 5, "got {} frames", frames.len());
        assert!(is_key(&frames[0]));
        assert!(!is_key(&frames[1]));

        let before = recorder.0.lock().len();
        capture.request_keyframe();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let count = {
            let frames = recorder.0.lock();
            assert!(frames.len() > before);
            assert!(is_key(&frames[before]));
            frames.len()
        };

        capture.set_output(None);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(recorder.0.lock().len(), count);

        cancel.cancel();
        task.await.unwrap();
    }
}
