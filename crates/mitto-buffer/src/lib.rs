//! Coalesces an agent's streaming text into readable chunks and holds
//! discrete events (tool calls, plans, file ops) back while a markdown
//! block is still open, so a client never sees a list or table
//! half-rendered.
//!
//! [`StreamBuffer`] is a plain synchronous struct. It does not own a
//! clock or a background task: the idle-timeout trigger is driven by
//! whoever calls [`StreamBuffer::check_idle`] on a timer.

mod scan;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use mitto_store::Event;

pub use scan::BlockKind;

/// Something the buffer is ready to hand off to the caller.
#[derive(Debug, Clone)]
pub enum Emission {
    /// Coalesced agent text, rendered to HTML, sharing one `seq`.
    Text { seq: i64, html: String },
    /// A discrete event that was either emitted immediately or released
    /// from hold-back once the block it arrived during closed.
    Discrete(Event),
}

#[derive(Debug, Clone, Copy)]
pub struct BufferConfig {
    pub max_size: usize,
    pub idle_timeout: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: 4096,
            idle_timeout: Duration::from_millis(200),
        }
    }
}

/// Per-session text coalescing and discrete-event hold-back.
///
/// One instance lives for the duration of a single prompt turn; the
/// runtime drops and recreates it (or calls [`StreamBuffer::flush`]) at
/// prompt boundaries.
pub struct StreamBuffer {
    config: BufferConfig,
    text: String,
    pending_seq: Option<i64>,
    block: scan::BlockScanner,
    pending_discrete: VecDeque<Event>,
    last_write_at: Option<Instant>,
}

impl StreamBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            text: String::new(),
            pending_seq: None,
            block: scan::BlockScanner::default(),
            pending_discrete: VecDeque::new(),
            last_write_at: None,
        }
    }

    fn in_block(&self) -> bool {
        self.block.in_block()
    }

    /// Append a chunk of streamed agent text under `seq` (the seq of the
    /// first chunk in the run; later chunks of the same run pass the
    /// same value).
    pub fn write(&mut self, seq: i64, chunk: &str) -> Vec<Emission> {
        if self.pending_seq.is_none() {
            self.pending_seq = Some(seq);
        }
        self.text.push_str(chunk);
        self.last_write_at = Some(Instant::now());
        let just_closed = self.block.rescan(&self.text);
        self.maybe_flush(just_closed)
    }

    /// Submit a discrete (non-coalescing) event. Held back if a block is
    /// currently open; otherwise flushes any complete, balanced text
    /// first and then emits immediately.
    pub fn submit_discrete(&mut self, event: Event) -> Vec<Emission> {
        if self.in_block() {
            self.pending_discrete.push_back(event);
            return Vec::new();
        }
        let mut out = Vec::new();
        if !self.text.is_empty() && self.text.ends_with('\n') && inline_balanced(&self.text) {
            out.extend(self.do_flush());
        }
        out.push(Emission::Discrete(event));
        out
    }

    /// Called by the runtime on its idle timer; flushes if the buffer
    /// has been quiet for `idle_timeout` and formatting is balanced.
    pub fn check_idle(&mut self, now: Instant) -> Vec<Emission> {
        if self.text.is_empty() {
            return Vec::new();
        }
        let Some(last) = self.last_write_at else {
            return Vec::new();
        };
        if now.duration_since(last) >= self.config.idle_timeout && inline_balanced(&self.text) {
            self.do_flush()
        } else {
            Vec::new()
        }
    }

    /// Force emission of whatever is buffered, regardless of block state
    /// or formatting balance. Used at prompt end and on cancellation.
    pub fn flush(&mut self) -> Vec<Emission> {
        self.do_flush()
    }

    /// Peek at the buffered text without consuming it, for a late
    /// observer joining mid-stream.
    pub fn peek(&self) -> Option<(i64, String)> {
        if self.text.is_empty() {
            None
        } else {
            Some((self.pending_seq.expect("text implies pending_seq"), render(&self.text)))
        }
    }

    fn maybe_flush(&mut self, just_closed_block: bool) -> Vec<Emission> {
        let trigger = just_closed_block
            || (!self.in_block() && self.text.ends_with('\n') && inline_balanced(&self.text))
            || (self.text.len() >= self.config.max_size && inline_balanced(&self.text));
        if trigger {
            self.do_flush()
        } else {
            Vec::new()
        }
    }

    fn do_flush(&mut self) -> Vec<Emission> {
        let mut out = Vec::new();
        if !self.text.is_empty() {
            let seq = self.pending_seq.take().expect("text present implies pending_seq set");
            out.push(Emission::Text {
                seq,
                html: render(&self.text),
            });
            self.text.clear();
            self.block.reset();
        }
        while let Some(ev) = self.pending_discrete.pop_front() {
            out.push(Emission::Discrete(ev));
        }
        out
    }
}

fn inline_balanced(s: &str) -> bool {
    s.matches("**").count() % 2 == 0 && s.chars().filter(|&c| c == '`').count() % 2 == 0
}

fn render(markdown: &str) -> String {
    use pulldown_cmark::{html, Parser};
    let parser = Parser::new(markdown);
    let mut out = String::new();
    html::push_html(&mut out, parser);
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discrete(seq: i64, kind: &str) -> Event {
        match kind {
            "tool_call" => Event::tool_call(seq, "t1", "run tests", "pending"),
            other => panic!("unhandled test kind {other}"),
        }
    }

    #[test]
    fn plain_line_flushes_on_newline() {
        let mut buf = StreamBuffer::new(BufferConfig::default());
        let out = buf.write(1, "hello world\n");
        assert_eq!(out.len(), 1);
        match &out[0] {
            Emission::Text { seq, html } => {
                assert_eq!(*seq, 1);
                assert!(html.contains("hello world"));
            }
            _ => panic!("expected text emission"),
        }
    }

    #[test]
    fn unterminated_line_does_not_flush() {
        let mut buf = StreamBuffer::new(BufferConfig::default());
        let out = buf.write(1, "hello without newline yet");
        assert!(out.is_empty());
    }

    #[test]
    fn unbalanced_bold_marker_holds_back_flush_until_closed() {
        let mut buf = StreamBuffer::new(BufferConfig::default());
        let out = buf.write(1, "this is **bold\n");
        assert!(out.is_empty(), "unbalanced ** must not flush yet");
        let out = buf.write(1, "still bold** done\n");
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn list_block_holds_back_until_blank_line_closes_it() {
        let mut buf = StreamBuffer::new(BufferConfig::default());
        assert!(buf.write(1, "- a\n").is_empty());
        assert!(buf.write(1, "- b\n").is_empty());
        assert!(buf.write(1, "- c\n").is_empty());
        let out = buf.write(1, "\n");
        assert_eq!(out.len(), 1);
        match &out[0] {
            Emission::Text { html, .. } => {
                assert!(html.contains("<li>a</li>"));
                assert!(html.contains("<li>b</li>"));
                assert!(html.contains("<li>c</li>"));
            }
            _ => panic!("expected text"),
        }
    }

    #[test]
    fn fenced_code_block_holds_back_until_closing_fence() {
        let mut buf = StreamBuffer::new(BufferConfig::default());
        assert!(buf.write(1, "```rust\n").is_empty());
        assert!(buf.write(1, "fn main() {}\n").is_empty());
        let out = buf.write(1, "```\n");
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn discrete_event_held_back_while_block_open_then_released_in_order() {
        let mut buf = StreamBuffer::new(BufferConfig::default());
        assert!(buf.write(1, "- a\n").is_empty());
        let held = buf.submit_discrete(discrete(2, "tool_call"));
        assert!(held.is_empty(), "discrete must be held back inside open list");
        let out = buf.write(1, "\n");
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Emission::Text { .. }));
        assert!(matches!(out[1], Emission::Discrete(_)));
    }

    #[test]
    fn discrete_event_outside_block_emits_immediately() {
        let mut buf = StreamBuffer::new(BufferConfig::default());
        assert!(buf.write(1, "hello\n").is_empty() == false); // flushed already
        let out = buf.submit_discrete(discrete(2, "tool_call"));
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Emission::Discrete(_)));
    }

    #[test]
    fn size_threshold_flushes_when_balanced() {
        let mut buf = StreamBuffer::new(BufferConfig {
            max_size: 16,
            idle_timeout: Duration::from_millis(200),
        });
        let out = buf.write(1, "no newline here but long enough to cross threshold");
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn idle_timeout_flushes_balanced_buffer() {
        let mut buf = StreamBuffer::new(BufferConfig {
            max_size: 4096,
            idle_timeout: Duration::from_millis(1),
        });
        assert!(buf.write(1, "partial line no newline").is_empty());
        std::thread::sleep(Duration::from_millis(5));
        let out = buf.check_idle(Instant::now());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn explicit_flush_forces_emission_mid_block() {
        let mut buf = StreamBuffer::new(BufferConfig::default());
        assert!(buf.write(1, "- a\n").is_empty());
        let out = buf.flush();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn peek_renders_without_consuming() {
        let mut buf = StreamBuffer::new(BufferConfig::default());
        buf.write(1, "- a\n");
        let (seq, html) = buf.peek().unwrap();
        assert_eq!(seq, 1);
        assert!(html.contains("a"));
        // still buffered: a second peek gives the same thing
        assert!(buf.peek().is_some());
    }
}
