use std::io::Write;

use parking_lot::Mutex;

use crate::media::DecodedFrame;

/// Everything the front end is told. The front end never talks back through
/// this path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Status(String),
    Frame(DecodedFrame),
    ClearFrame,
    ChatReceived(String),
    ChatSent(String),
    ConnectionStarted,
    ConnectionEnded,
    DataOpened,
}

pub trait StatusSink: Send + Sync {
    fn dispatch(&self, event: UiEvent);
}

/// Line-oriented front end: status and chat go to stdout, frames are reduced
/// to a brightness readout shown on request.
pub struct ConsoleSink<W: Write + Send> {
    out: Mutex<W>,
    last_frame: Mutex<Option<DecodedFrame>>,
}

impl ConsoleSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            last_frame: Mutex::new(None),
        }
    }

    /// Mean luma of the most recent frame, if any.
    pub fn brightness(&self) -> Option<u8> {
        let frame = self.last_frame.lock();
        let frame = frame.as_ref()?;
        if frame.luma.is_empty() {
            return Some(0);
        }
        let sum: u64 = frame.luma.iter().map(|&v| v as u64).sum();
        Some((sum / frame.luma.len() as u64) as u8)
    }

    fn line(&self, text: &str) {
        let mut out = self.out.lock();
        let _ = writeln!(out, "{text}");
        let _ = out.flush();
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write + Send> StatusSink for ConsoleSink<W> {
    fn dispatch(&self, event: UiEvent) {
        match event {
            UiEvent::Status(text) => self.line(&format!("* {text}")),
            UiEvent::ChatReceived(text) => self.line(&format!("stranger: {text}")),
            UiEvent::ChatSent(text) => self.line(&format!("you: {text}")),
            UiEvent::DataOpened => self.line("* You can chat now. /next skips, /quit leaves."),
            UiEvent::Frame(frame) => *self.last_frame.lock() = Some(frame),
            UiEvent::ClearFrame => *self.last_frame.lock() = None,
            UiEvent::ConnectionStarted | UiEvent::ConnectionEnded => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::RawFrame;

    #[test]
    fn console_prints_status_and_chat() {
        let sink = ConsoleSink::new(Vec::new());
        sink.dispatch(UiEvent::Status("Searching for match...".into()));
        sink.dispatch(UiEvent::ChatReceived("hello".into()));
        sink.dispatch(UiEvent::ChatSent("hi".into()));
        sink.dispatch(UiEvent::ConnectionStarted);
        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(text, "* Searching for match...\nstranger: hello\nyou: hi\n");
    }

    #[test]
    fn frames_are_kept_until_cleared() {
        let sink = ConsoleSink::new(Vec::new());
        assert_eq!(sink.brightness(), None);
        sink.dispatch(UiEvent::Frame(RawFrame {
            width: 2,
            height: 1,
            luma: vec![10, 30],
        }));
        assert_eq!(sink.brightness(), Some(20));
        sink.dispatch(UiEvent::ClearFrame);
        assert_eq!(sink.brightness(), None);
    }
}
