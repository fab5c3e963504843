//! Per-call real-time audio pipeline.
//!
//! Ingress frames are forwarded to the recognition stream as they arrive;
//! the only buffering is a bounded ring that drops its oldest frame on
//! backpressure (logged, never fatal). While synthesis is playing, the
//! same fragment stream doubles as the start-of-speech monitor: the
//! pipeline issues the stop/clear command to the switch and enqueues the
//! barge-in signal before forwarding anything else, so the session can
//! never observe a playback completion for an utterance that was already
//! interrupted.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use crate::core::backends::{BackendError, RecognitionClient, RecognitionStream};
use crate::core::esl::SwitchControl;
use crate::core::session::session_event::SessionEvent;

/// Frames buffered before the oldest is dropped.
const FRAME_BUFFER_CAPACITY: usize = 64;

struct FrameQueue {
    frames: parking_lot::Mutex<VecDeque<Bytes>>,
    notify: Notify,
}

impl FrameQueue {
    fn new() -> Self {
        Self {
            frames: parking_lot::Mutex::new(VecDeque::with_capacity(FRAME_BUFFER_CAPACITY)),
            notify: Notify::new(),
        }
    }

    /// Push a frame, evicting the oldest when full.
    fn push(&self, frame: Bytes) -> bool {
        let mut frames = self.frames.lock();
        let dropped = if frames.len() >= FRAME_BUFFER_CAPACITY {
            frames.pop_front();
            true
        } else {
            false
        };
        frames.push_back(frame);
        drop(frames);
        self.notify.notify_one();
        dropped
    }

    fn pop(&self) -> Option<Bytes> {
        self.frames.lock().pop_front()
    }
}

pub struct PipelineConfig {
    pub ingress_rate: u32,
    pub recognition_rate: u32,
}

/// Handle owned by the session; the io task runs until the session drops
/// or closes it.
pub struct AudioPipeline {
    queue: Arc<FrameQueue>,
    playing: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl AudioPipeline {
    /// Open the recognition stream and start the pipeline task for one
    /// call leg.
    pub async fn start(
        session_id: String,
        leg_id: String,
        recognition: Arc<dyn RecognitionClient>,
        switch: Arc<dyn SwitchControl>,
        events: mpsc::Sender<SessionEvent>,
        config: PipelineConfig,
    ) -> Result<Self, BackendError> {
        let stream = recognition.start_stream().await?;

        let queue = Arc::new(FrameQueue::new());
        let playing = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));

        let pipeline = Self {
            queue: queue.clone(),
            playing: playing.clone(),
            closed: closed.clone(),
        };

        tokio::spawn(run_pipeline(
            session_id, leg_id, stream, switch, events, queue, playing, closed, config,
        ));

        Ok(pipeline)
    }

    /// Feed one frame of leg audio. Synchronous and lock-cheap: safe to
    /// call from the media ingress path.
    pub fn ingest_frame(&self, frame: Bytes) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.queue.push(frame) {
            warn!("audio buffer full, dropped oldest frame");
        }
    }

    /// Mark whether synthesis is currently playing on the leg. While set,
    /// incoming speech triggers barge-in handling.
    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Release);
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.queue.notify.notify_one();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    session_id: String,
    leg_id: String,
    mut stream: RecognitionStream,
    switch: Arc<dyn SwitchControl>,
    events: mpsc::Sender<SessionEvent>,
    queue: Arc<FrameQueue>,
    playing: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    config: PipelineConfig,
) {
    loop {
        if closed.load(Ordering::Acquire) {
            break;
        }

        tokio::select! {
            _ = queue.notify.notified() => {
                while let Some(frame) = queue.pop() {
                    let pcm = super::resample::resample_pcm16(
                        &frame,
                        config.ingress_rate,
                        config.recognition_rate,
                    );
                    // Forward as received: no batching on the hot path.
                    if stream.audio_tx.send(Bytes::from(pcm)).await.is_err() {
                        debug!(%session_id, "recognition stream gone, pipeline stopping");
                        return;
                    }
                }
            }

            update = stream.updates_rx.recv() => {
                match update {
                    Some(Ok(fragment)) => {
                        let speech = !fragment.text.trim().is_empty();
                        if speech && playing.swap(false, Ordering::AcqRel) {
                            // Barge-in: clear switch playback and signal the
                            // session before the fragment itself is
                            // forwarded, so the interrupt is observed ahead
                            // of any completion event.
                            if let Err(e) = switch.stop_play(&leg_id).await {
                                warn!(%session_id, error = %e, "stop-play on barge-in failed");
                            }
                            if events.send(SessionEvent::SpeechStarted).await.is_err() {
                                return;
                            }
                        }
                        if speech {
                            let sent = events
                                .send(SessionEvent::Transcript {
                                    text: fragment.text,
                                    is_final: fragment.is_final,
                                })
                                .await;
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Err(error)) => {
                        // Surfaced upward; the session decides fallback vs end.
                        let _ = events
                            .send(SessionEvent::RecognitionFailed { error })
                            .await;
                        return;
                    }
                    None => {
                        debug!(%session_id, "recognition stream closed, pipeline stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    use crate::core::backends::TranscriptFragment;
    use crate::core::esl::EslResult;

    struct ScriptedRecognition {
        updates: parking_lot::Mutex<Option<mpsc::Receiver<Result<TranscriptFragment, BackendError>>>>,
        /// Forwards whatever audio the pipeline sends, so tests can
        /// observe the stream input.
        audio_tap: mpsc::UnboundedSender<Bytes>,
    }

    #[async_trait]
    impl RecognitionClient for ScriptedRecognition {
        async fn start_stream(&self) -> Result<RecognitionStream, BackendError> {
            let (audio_tx, mut audio_rx) = mpsc::channel(16);
            let tap = self.audio_tap.clone();
            tokio::spawn(async move {
                while let Some(frame) = audio_rx.recv().await {
                    let _ = tap.send(frame);
                }
            });
            let updates_rx = self.updates.lock().take().expect("stream started twice");
            Ok(RecognitionStream {
                audio_tx,
                updates_rx,
            })
        }
    }

    #[derive(Default)]
    struct RecordingSwitch {
        stops: AtomicUsize,
    }

    #[async_trait]
    impl SwitchControl for RecordingSwitch {
        async fn answer(&self, _leg_id: &str) -> EslResult<()> {
            Ok(())
        }
        async fn play(&self, _leg_id: &str, _audio_ref: &str) -> EslResult<()> {
            Ok(())
        }
        async fn stop_play(&self, _leg_id: &str) -> EslResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn hangup(&self, _leg_id: &str) -> EslResult<()> {
            Ok(())
        }
        async fn originate(&self, _dial: &str, _target: &str) -> EslResult<String> {
            Ok("leg-x".to_string())
        }
    }

    async fn start_pipeline(
        switch: Arc<RecordingSwitch>,
    ) -> (
        AudioPipeline,
        mpsc::Sender<Result<TranscriptFragment, BackendError>>,
        mpsc::Receiver<SessionEvent>,
        mpsc::UnboundedReceiver<Bytes>,
    ) {
        let (updates_tx, updates_rx) = mpsc::channel(16);
        let (audio_tap, audio_seen) = mpsc::unbounded_channel();
        let recognition = Arc::new(ScriptedRecognition {
            updates: parking_lot::Mutex::new(Some(updates_rx)),
            audio_tap,
        });
        let (events_tx, events_rx) = mpsc::channel(16);
        let pipeline = AudioPipeline::start(
            "s-1".to_string(),
            "leg-1".to_string(),
            recognition,
            switch,
            events_tx,
            PipelineConfig {
                ingress_rate: 8000,
                recognition_rate: 16000,
            },
        )
        .await
        .unwrap();
        (pipeline, updates_tx, events_rx, audio_seen)
    }

    #[tokio::test]
    async fn test_frames_are_forwarded_resampled() {
        let switch = Arc::new(RecordingSwitch::default());
        let (pipeline, _updates_tx, _events_rx, mut audio_seen) =
            start_pipeline(switch).await;

        // 4 samples at 8 kHz in, 8 samples at 16 kHz out.
        let frame: Vec<u8> = [100i16, 200, 300, 400]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        pipeline.ingest_frame(Bytes::from(frame));

        let forwarded = audio_seen.recv().await.unwrap();
        assert_eq!(forwarded.len(), 16);
    }

    #[tokio::test]
    async fn test_barge_in_precedes_transcript() {
        let switch = Arc::new(RecordingSwitch::default());
        let (pipeline, updates_tx, mut events_rx, _audio_seen) = start_pipeline(switch.clone()).await;

        pipeline.set_playing(true);
        updates_tx
            .send(Ok(TranscriptFragment {
                text: "你好".to_string(),
                is_final: false,
            }))
            .await
            .unwrap();

        // Interrupt is observed first, then the fragment that caused it.
        assert!(matches!(
            events_rx.recv().await,
            Some(SessionEvent::SpeechStarted)
        ));
        assert!(matches!(
            events_rx.recv().await,
            Some(SessionEvent::Transcript { is_final: false, .. })
        ));
        assert_eq!(switch.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_barge_in_when_not_playing() {
        let switch = Arc::new(RecordingSwitch::default());
        let (_pipeline, updates_tx, mut events_rx, _audio_seen) = start_pipeline(switch.clone()).await;

        updates_tx
            .send(Ok(TranscriptFragment {
                text: "喂".to_string(),
                is_final: true,
            }))
            .await
            .unwrap();

        assert!(matches!(
            events_rx.recv().await,
            Some(SessionEvent::Transcript { is_final: true, .. })
        ));
        assert_eq!(switch.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_fragments_do_not_trigger_barge_in() {
        let switch = Arc::new(RecordingSwitch::default());
        let (pipeline, updates_tx, mut events_rx, _audio_seen) = start_pipeline(switch.clone()).await;

        pipeline.set_playing(true);
        updates_tx
            .send(Ok(TranscriptFragment {
                text: "  ".to_string(),
                is_final: false,
            }))
            .await
            .unwrap();
        updates_tx
            .send(Ok(TranscriptFragment {
                text: "好的".to_string(),
                is_final: false,
            }))
            .await
            .unwrap();

        // The blank fragment is swallowed entirely.
        assert!(matches!(
            events_rx.recv().await,
            Some(SessionEvent::SpeechStarted)
        ));
    }

    #[tokio::test]
    async fn test_recognition_error_is_surfaced() {
        let switch = Arc::new(RecordingSwitch::default());
        let (_pipeline, updates_tx, mut events_rx, _audio_seen) = start_pipeline(switch).await;

        updates_tx
            .send(Err(BackendError::Unavailable("asr down".to_string())))
            .await
            .unwrap();

        assert!(matches!(
            events_rx.recv().await,
            Some(SessionEvent::RecognitionFailed { .. })
        ));
    }

    #[test]
    fn test_frame_queue_drops_oldest() {
        let queue = FrameQueue::new();
        for i in 0..FRAME_BUFFER_CAPACITY {
            assert!(!queue.push(Bytes::from(vec![i as u8])));
        }
        assert!(queue.push(Bytes::from(vec![0xFF])));
        // the first frame is gone
        assert_eq!(queue.pop().unwrap()[0], 1);
    }
}
