use crate::dialog::dialog::DialogInnerRef;
use crate::media::MediaEngine;
use crate::Result;
use rsip::Header;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a digit travels: a SIP INFO request or an in-band RTP
/// telephone-event inserted by the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtmfMode {
    Info,
    Rfc2833,
}

#[derive(Debug, Clone)]
pub struct DtmfRequest {
    pub digit: char,
    pub duration: Duration,
    pub mode: DtmfMode,
}

/// Snapshot of the queue, published on every enqueue and dequeue.
#[derive(Debug, Clone, Default)]
pub struct DtmfQueueStatus {
    pub pending: usize,
    pub draining: bool,
    /// The pending digits, concatenated in send order.
    pub digits: String,
}

pub fn is_valid_digit(c: char) -> bool {
    c.is_ascii_digit() || matches!(c, '*' | '#' | 'A' | 'B' | 'C' | 'D')
}

/// Per-call FIFO of digits. A drainer task runs only while the call can
/// carry DTMF; it pops digits strictly in order and paces them with
/// `duration + gap` of silence between tones.
pub(crate) struct DtmfDispatcher {
    dialog: Mutex<Option<DialogInnerRef>>,
    media: Arc<dyn MediaEngine>,
    gap: Duration,
    queue: Mutex<VecDeque<DtmfRequest>>,
    notify: Notify,
    status_tx: Arc<watch::Sender<DtmfQueueStatus>>,
}

impl DtmfDispatcher {
    pub fn new(
        media: Arc<dyn MediaEngine>,
        gap: Duration,
        status_tx: Arc<watch::Sender<DtmfQueueStatus>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dialog: Mutex::new(None),
            media,
            gap,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            status_tx,
        })
    }

    /// The INFO path needs the dialog; it exists only once the call has
    /// one.
    pub fn set_dialog(&self, dialog: DialogInnerRef) {
        self.dialog.lock().unwrap().replace(dialog);
    }

    pub fn enqueue(&self, request: DtmfRequest) -> Result<()> {
        if !is_valid_digit(request.digit) {
            return Err(crate::Error::CallError(format!(
                "invalid DTMF digit: {:?}",
                request.digit
            )));
        }
        self.queue.lock().unwrap().push_back(request);
        self.publish(true);
        self.notify.notify_one();
        Ok(())
    }

    /// Drop everything still pending; returns the aborted digits.
    pub fn flush(&self) -> String {
        let aborted: String = self
            .queue
            .lock()
            .unwrap()
            .drain(..)
            .map(|r| r.digit)
            .collect();
        if !aborted.is_empty() {
            warn!("aborting pending DTMF digits: {}", aborted);
        }
        self.publish(false);
        aborted
    }

    fn publish(&self, draining: bool) {
        let queue = self.queue.lock().unwrap();
        let status = DtmfQueueStatus {
            pending: queue.len(),
            draining,
            digits: queue.iter().map(|r| r.digit).collect(),
        };
        drop(queue);
        self.status_tx.send(status).ok();
    }

    async fn send_digit(&self, request: &DtmfRequest) -> Result<()> {
        match request.mode {
            DtmfMode::Info => {
                let dialog = self.dialog.lock().unwrap().clone();
                let dialog = dialog.ok_or_else(|| {
                    crate::Error::CallError("no dialog for DTMF INFO".to_string())
                })?;
                let body = format!(
                    "Signal={}\nDuration={}\n",
                    request.digit,
                    request.duration.as_millis()
                );
                let headers = vec![Header::ContentType("application/dtmf-relay".into())];
                let info = dialog.make_request(
                    rsip::Method::Info,
                    None,
                    Some(headers),
                    Some(body.into_bytes()),
                )?;
                dialog.do_request(info).await?;
                Ok(())
            }
            DtmfMode::Rfc2833 => self.media.send_dtmf(request.digit, request.duration).await,
        }
    }

    /// Drainer body; one task per call, cancelled when the call leaves
    /// the DTMF-capable states.
    pub async fn drain(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let next = self.queue.lock().unwrap().pop_front();
            match next {
                Some(request) => {
                    self.publish(true);
                    if let Err(e) = self.send_digit(&request).await {
                        warn!("failed to send DTMF digit {}: {}", request.digit, e);
                    } else {
                        debug!("sent DTMF digit {} ({:?})", request.digit, request.mode);
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(request.duration + self.gap) => {}
                    }
                }
                None => {
                    self.publish(false);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::NullMediaEngine;

    fn dispatcher() -> (Arc<DtmfDispatcher>, watch::Receiver<DtmfQueueStatus>) {
        let (status_tx, status_rx) = watch::channel(DtmfQueueStatus::default());
        let dispatcher = DtmfDispatcher::new(
            Arc::new(NullMediaEngine),
            Duration::from_millis(40),
            Arc::new(status_tx),
        );
        (dispatcher, status_rx)
    }

    fn digit(c: char) -> DtmfRequest {
        DtmfRequest {
            digit: c,
            duration: Duration::from_millis(120),
            mode: DtmfMode::Rfc2833,
        }
    }

    #[test]
    fn test_enqueue_validates_digits() {
        let (dispatcher, status_rx) = dispatcher();
        assert!(dispatcher.enqueue(digit('1')).is_ok());
        assert!(dispatcher.enqueue(digit('#')).is_ok());
        assert!(dispatcher.enqueue(digit('A')).is_ok());
        assert!(dispatcher.enqueue(digit('x')).is_err());

        let status = status_rx.borrow();
        assert_eq!(status.pending, 3);
        assert_eq!(status.digits, "1#A");
    }

    #[test]
    fn test_flush_reports_aborted_digits() {
        let (dispatcher, status_rx) = dispatcher();
        dispatcher.enqueue(digit('1')).expect("enqueue");
        dispatcher.enqueue(digit('2')).expect("enqueue");
        assert_eq!(dispatcher.flush(), "12");
        assert_eq!(status_rx.borrow().pending, 0);
        assert!(!status_rx.borrow().draining);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_preserves_fifo_order_and_pacing() {
        use std::sync::Mutex as StdMutex;
        use tokio::time::Instant;

        struct RecordingEngine {
            sent: StdMutex<Vec<(char, Instant)>>,
        }

        #[async_trait::async_trait]
        impl crate::media::MediaEngine for RecordingEngine {
            async fn create_offer(&self) -> crate::Result<String> {
                Ok(String::new())
            }
            async fn create_answer(&self, _remote_sdp: &str) -> crate::Result<String> {
                Ok(String::new())
            }
            async fn set_remote_description(
                &self,
                _sdp: &str,
                _kind: crate::media::SdpKind,
            ) -> crate::Result<()> {
                Ok(())
            }
            async fn set_audio_enabled(&self, _enabled: bool) {}
            async fn set_muted(&self, _muted: bool) {}
            async fn send_dtmf(&self, digit: char, _duration: Duration) -> crate::Result<()> {
                self.sent.lock().unwrap().push((digit, Instant::now()));
                Ok(())
            }
            async fn dispose(&self) {}
        }

        let engine = Arc::new(RecordingEngine {
            sent: StdMutex::new(Vec::new()),
        });
        let (status_tx, _status_rx) = watch::channel(DtmfQueueStatus::default());
        let dispatcher =
            DtmfDispatcher::new(engine.clone(), Duration::from_millis(40), Arc::new(status_tx));

        for c in ['1', '2', '3'] {
            dispatcher.enqueue(digit(c)).expect("enqueue");
        }

        let cancel = CancellationToken::new();
        let drainer = tokio::spawn(dispatcher.clone().drain(cancel.clone()));

        // three tones at 120 ms + 40 ms gap each
        tokio::time::sleep(Duration::from_millis(600)).await;
        cancel.cancel();
        drainer.await.expect("drainer");

        let sent = engine.sent.lock().unwrap();
        let digits: String = sent.iter().map(|(c, _)| *c).collect();
        assert_eq!(digits, "123");
        for pair in sent.windows(2) {
            let spacing = pair[1].1.duration_since(pair[0].1);
            assert!(spacing >= Duration::from_millis(160), "spacing {:?}", spacing);
        }
    }
}
