//! Offline backend: word-by-word mirror replies, scripted events, or test-driven streams.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{GenerationEvent, GenerationService, TurnRequest};
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub enum MockReply {
    /// Stream a short reflective reply built from the user's text, one word at a time.
    Mirror,
    /// Emit these events in order, then end.
    Events(Vec<GenerationEvent>),
    /// Refuse to connect.
    ConnectError(String),
    /// Hand the event sender to the test through [`MockService::take_manual_streams`].
    Manual,
}

pub struct MockService {
    script: Mutex<VecDeque<MockReply>>,
    fallback: MockReply,
    delay: Duration,
    requests: Mutex<Vec<TurnRequest>>,
    manual_tx: mpsc::UnboundedSender<mpsc::Sender<GenerationEvent>>,
    manual_rx: Mutex<Option<mpsc::UnboundedReceiver<mpsc::Sender<GenerationEvent>>>>,
}

impl Default for MockService {
    fn default() -> Self {
        Self::mirror()
    }
}

impl MockService {
    fn with_fallback(fallback: MockReply) -> Self {
        let (manual_tx, manual_rx) = mpsc::unbounded_channel();
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::from_millis(30),
            requests: Mutex::new(Vec::new()),
            manual_tx,
            manual_rx: Mutex::new(Some(manual_rx)),
        }
    }

    pub fn mirror() -> Self {
        Self::with_fallback(MockReply::Mirror)
    }

    /// Every turn is driven by the test through [`take_manual_streams`](Self::take_manual_streams).
    pub fn manual() -> Self {
        Self::with_fallback(MockReply::Manual)
    }

    /// Replies consumed one per turn; mirror once exhausted.
    pub fn scripted(replies: impl IntoIterator<Item = MockReply>) -> Self {
        let svc = Self::mirror();
        if let Ok(mut s) = svc.script.lock() {
            s.extend(replies);
        }
        svc
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_reply(&self, reply: MockReply) {
        if let Ok(mut s) = self.script.lock() {
            s.push_back(reply);
        }
    }

    /// Receiver of per-turn event senders for [`MockReply::Manual`] turns. Only the first call gets it.
    pub fn take_manual_streams(&self) -> Option<mpsc::UnboundedReceiver<mpsc::Sender<GenerationEvent>>> {
        self.manual_rx.lock().ok().and_then(|mut r| r.take())
    }

    /// Requests seen so far.
    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn mirror_reply(request: &TurnRequest) -> String {
        let said: String = request
            .input
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join(" ");
        let said = said.trim();
        if said.is_empty() {
            "Je vous écoute. Qu'est-ce qui vous amène ici ?".to_string()
        } else {
            format!("J'entends : « {said} ». Qu'est-ce qui est le plus présent pour vous en ce moment ?")
        }
    }
}

#[async_trait]
impl GenerationService for MockService {
    async fn stream_turn(&self, request: TurnRequest) -> CoreResult<mpsc::Receiver<GenerationEvent>> {
        let reply = self
            .script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or_else(|| self.fallback.clone());

        let events: Vec<GenerationEvent> = match &reply {
            MockReply::Mirror => Self::mirror_reply(&request)
                .split_inclusive(' ')
                .map(|w| GenerationEvent::Text(w.to_string()))
                .collect(),
            MockReply::Events(events) => events.clone(),
            MockReply::ConnectError(msg) => {
                return Err(CoreError::Transport(msg.clone()));
            }
            MockReply::Manual => Vec::new(),
        };
        if let Ok(mut r) = self.requests.lock() {
            r.push(request);
        }

        let (tx, rx) = mpsc::channel::<GenerationEvent>(100);
        if matches!(reply, MockReply::Manual) {
            self.manual_tx
                .send(tx)
                .map_err(|_| CoreError::Transport("manual stream receiver dropped".into()))?;
            return Ok(rx);
        }

        let delay = self.delay;
        tokio::spawn(async move {
            for event in events {
                if tx.send(event).await.is_err() {
                    break;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        });
        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
