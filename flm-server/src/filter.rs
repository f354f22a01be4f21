//! Streaming filters.
//!
//! [`Utf8Gate`] holds back the tail of an incomplete UTF-8 code point so no
//! chunk ever splits a character; finalization flushes whatever remains,
//! malformed or not. [`HarmonyFilter`] tracks the reasoning/response channel
//! markers some chat templates emit and classifies each fragment.

use flm_engine::template::{
    REASONING_END_MARKER, REASONING_START_MARKER, SPECIAL_TOKEN_CLOSE, SPECIAL_TOKEN_OPEN,
};

/// Accumulates bytes and releases only complete UTF-8 sequences.
#[derive(Debug, Default)]
pub struct Utf8Gate {
    buffer: Vec<u8>,
}

impl Utf8Gate {
    pub fn new() -> Self {
        Self::default()
    }

    fn sequence_len(first: u8) -> usize {
        if first & 0x80 == 0 {
            1
        } else if first & 0xE0 == 0xC0 {
            2
        } else if first & 0xF0 == 0xE0 {
            3
        } else if first & 0xF8 == 0xF0 {
            4
        } else {
            0
        }
    }

    /// Feed bytes in, get the complete prefix out. The tail of an incomplete
    /// sequence stays buffered for the next push.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.buffer.extend_from_slice(bytes);
        let mut pos = 0;
        while pos < self.buffer.len() {
            let len = Self::sequence_len(self.buffer[pos]);
            if len == 0 {
                // Invalid start byte: pass it through rather than stall.
                pos += 1;
                continue;
            }
            if pos + len > self.buffer.len() {
                break;
            }
            pos += len;
        }
        let complete: Vec<u8> = self.buffer.drain(..pos).collect();
        String::from_utf8_lossy(&complete).into_owned()
    }

    /// Hand back everything still buffered, malformed tail included.
    pub fn finalize(&mut self) -> String {
        let rest: Vec<u8> = self.buffer.drain(..).collect();
        String::from_utf8_lossy(&rest).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Which channel a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Template scaffolding and special tokens; never emitted.
    Template,
    /// Hidden reasoning content.
    Reasoning,
    /// User-visible response content.
    Response,
}

/// State machine over the channel markers: idle -> reasoning -> response.
/// Marker tokens themselves are suppressed as template content, and so is
/// the turn header between `<|start|>`/`<|channel|>` and `<|message|>`
/// (role and channel names arrive as ordinary tokens).
#[derive(Debug)]
pub struct HarmonyFilter {
    buffer: String,
    in_reasoning: bool,
    in_template: bool,
}

impl Default for HarmonyFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl HarmonyFilter {
    pub fn new() -> Self {
        Self {
            buffer: String::with_capacity(256),
            in_reasoning: false,
            in_template: false,
        }
    }

    fn is_special(fragment: &str) -> bool {
        fragment.contains(SPECIAL_TOKEN_OPEN) && fragment.contains(SPECIAL_TOKEN_CLOSE)
    }

    /// Classify one fragment of decoded text.
    pub fn classify(&mut self, fragment: &str) -> Channel {
        self.buffer.push_str(fragment);
        let special = Self::is_special(fragment);
        if special {
            // `<|message|>` opens content; anything else that is special
            // (`<|start|>`, `<|channel|>`, `<|end|>`, `<|return|>`) opens a
            // header region whose plain tokens are template text.
            if fragment.contains("<|message|>") {
                self.in_template = false;
            } else {
                self.in_template = true;
            }
        }
        if !self.in_reasoning && self.buffer.contains(REASONING_START_MARKER) {
            self.in_reasoning = true;
            self.buffer.clear();
        }
        if self.in_reasoning && self.buffer.contains(REASONING_END_MARKER) {
            self.in_reasoning = false;
            self.buffer.clear();
        }

        if self.in_template || special {
            Channel::Template
        } else if self.in_reasoning {
            Channel::Reasoning
        } else {
            Channel::Response
        }
    }
}

/// Non-streaming accumulator: splits a whole generation into response and
/// reasoning text through the same filters the streaming path uses.
#[derive(Debug, Default)]
pub struct ChannelCollector {
    utf8: Utf8Gate,
    harmony: Option<HarmonyFilter>,
    pub content: String,
    pub thinking: String,
}

impl ChannelCollector {
    pub fn new(harmony: bool) -> Self {
        Self {
            harmony: harmony.then(HarmonyFilter::new),
            ..Default::default()
        }
    }

    fn take(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        match self.harmony.as_mut() {
            Some(filter) => match filter.classify(fragment) {
                Channel::Template => {}
                Channel::Reasoning => self.thinking.push_str(fragment),
                Channel::Response => self.content.push_str(fragment),
            },
            None => self.content.push_str(fragment),
        }
    }

    pub fn finalize(&mut self) {
        let tail = self.utf8.finalize();
        self.take(&tail);
    }
}

impl flm_engine::TokenSink for ChannelCollector {
    fn push(&mut self, text: &str) -> bool {
        let ready = self.utf8.push(text.as_bytes());
        self.take(&ready);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_gate_holds_partial_sequences() {
        let mut gate = Utf8Gate::new();
        // U+00E9 is 0xC3 0xA9; feed it split across pushes.
        assert_eq!(gate.push(b"caf\xC3"), "caf");
        assert!(!gate.is_empty());
        assert_eq!(gate.push(b"\xA9!"), "\u{e9}!");
        assert!(gate.is_empty());
    }

    #[test]
    fn test_utf8_gate_concatenation_is_identity() {
        let input = "héllo wörld — 你好 ✓".as_bytes();
        // Any byte partitioning reassembles to the same text.
        for split in 0..input.len() {
            let mut gate = Utf8Gate::new();
            let mut out = String::new();
            out.push_str(&gate.push(&input[..split]));
            out.push_str(&gate.push(&input[split..]));
            out.push_str(&gate.finalize());
            assert_eq!(out.as_bytes(), input, "split at {split}");
        }
    }

    #[test]
    fn test_utf8_gate_finalize_flushes_malformed_tail() {
        let mut gate = Utf8Gate::new();
        assert_eq!(gate.push(b"ok\xF0\x9F"), "ok");
        let tail = gate.finalize();
        assert!(!tail.is_empty());
        assert!(gate.is_empty());
    }

    #[test]
    fn test_harmony_channel_transitions() {
        let mut filter = HarmonyFilter::new();
        assert_eq!(filter.classify("plain"), Channel::Response);

        let mut filter = HarmonyFilter::new();
        assert_eq!(
            filter.classify(REASONING_START_MARKER),
            Channel::Template
        );
        assert_eq!(filter.classify("thinking..."), Channel::Reasoning);
        assert_eq!(filter.classify(REASONING_END_MARKER), Channel::Template);
        assert_eq!(filter.classify("the answer"), Channel::Response);
    }

    #[test]
    fn test_harmony_suppresses_marker_fragments() {
        let mut filter = HarmonyFilter::new();
        assert_eq!(filter.classify("<|end|>"), Channel::Template);
    }

    #[test]
    fn test_harmony_token_at_a_time() {
        // Decoders emit markers as individual special tokens with plain
        // header words between them; those words are template text too.
        let mut filter = HarmonyFilter::new();
        for header in ["<|start|>", "assistant", "<|channel|>", "analysis"] {
            assert_eq!(filter.classify(header), Channel::Template, "{header}");
        }
        assert_eq!(filter.classify("<|message|>"), Channel::Template);
        assert_eq!(filter.classify("hmm"), Channel::Reasoning);
        assert_eq!(filter.classify("<|end|>"), Channel::Template);
        for header in ["<|start|>", "assistant", "<|channel|>", "final"] {
            assert_eq!(filter.classify(header), Channel::Template, "{header}");
        }
        assert_eq!(filter.classify("<|message|>"), Channel::Template);
        assert_eq!(filter.classify("four"), Channel::Response);
    }
}
