//! Ollama-style streaming wire format (`application/x-ndjson`).
//!
//! Intermediate lines carry the fragment and `done: false`; the final line
//! adds counts, durations and the stop reason. Chat responses nest content
//! under `message`, completions carry it as `response` plus the `context`
//! token array.

use serde_json::json;

use flm_engine::meta::ChatMeta;
use flm_engine::TokenSink;

use crate::filter::{Channel, HarmonyFilter, Utf8Gate};
use crate::http::ChunkSender;

pub struct OllamaStream<S> {
    model: String,
    is_chat: bool,
    utf8: Utf8Gate,
    harmony: Option<HarmonyFilter>,
    sender: S,
    failed: bool,
}

impl<S: ChunkSender> OllamaStream<S> {
    pub fn new(model: &str, is_chat: bool, harmony: bool, sender: S) -> Self {
        Self {
            model: model.to_string(),
            is_chat,
            utf8: Utf8Gate::new(),
            harmony: harmony.then(HarmonyFilter::new),
            sender,
            failed: false,
        }
    }

    fn split_channels(&mut self, fragment: &str) -> Option<(String, String)> {
        match self.harmony.as_mut() {
            Some(filter) => match filter.classify(fragment) {
                Channel::Template => None,
                Channel::Reasoning => Some((String::new(), fragment.to_string())),
                Channel::Response => Some((fragment.to_string(), String::new())),
            },
            None => Some((fragment.to_string(), String::new())),
        }
    }

    fn emit(&mut self, fragment: &str) -> bool {
        if fragment.is_empty() {
            return true;
        }
        let Some((content, thinking)) = self.split_channels(fragment) else {
            return true;
        };
        let line = if self.is_chat {
            json!({
                "model": self.model,
                "message": {
                    "role": "assistant",
                    "content": content,
                    "thinking": thinking,
                },
                "done": false,
            })
        } else {
            json!({
                "model": self.model,
                "response": content,
                "thinking": thinking,
                "done": false,
            })
        };
        let ok = self.sender.send(&format!("{line}\n"), false);
        if !ok {
            self.failed = true;
        }
        ok
    }

    fn flush_tail(&mut self) {
        let tail = self.utf8.finalize();
        if !tail.is_empty() {
            self.emit(&tail);
        }
    }

    /// Final line for a chat request.
    pub fn finalize_chat(&mut self, meta: &ChatMeta) {
        self.flush_tail();
        let line = json!({
            "model": self.model,
            "message": { "role": "assistant", "content": "" },
            "done": true,
            "done_reason": meta.stop_reason.as_str(),
            "prompt_eval_count": meta.prompt_tokens,
            "eval_count": meta.generated_tokens,
            "total_duration": meta.total_duration,
            "load_duration": meta.load_duration,
            "prompt_eval_duration": meta.prefill_duration,
            "eval_duration": meta.decoding_duration,
        });
        self.sender.send(&format!("{line}\n"), true);
    }

    /// Final line for a completion request, with the generated token ids as
    /// the `context` array.
    pub fn finalize_generate(&mut self, meta: &ChatMeta, context: &[u32]) {
        self.flush_tail();
        let line = json!({
            "model": self.model,
            "response": "",
            "context": context,
            "prompt_eval_count": meta.prompt_tokens,
            "eval_count": meta.generated_tokens,
            "total_duration": meta.total_duration,
            "load_duration": meta.load_duration,
            "prompt_eval_duration": meta.prefill_duration,
            "eval_duration": meta.decoding_duration,
            "done_reason": meta.stop_reason.as_str(),
            "done": true,
        });
        self.sender.send(&format!("{line}\n"), true);
    }

    /// Terminal chunk for a generation that died after headers went out.
    pub fn fail(&mut self, message: &str) {
        let line = json!({
            "model": self.model,
            "error": message,
            "done": true,
        });
        self.sender.send(&format!("{line}\n"), true);
    }

    pub fn failed(&self) -> bool {
        self.failed
    }
}

impl<S: ChunkSender> TokenSink for OllamaStream<S> {
    fn push(&mut self, text: &str) -> bool {
        if self.failed {
            return false;
        }
        let ready = self.utf8.push(text.as_bytes());
        self.emit(&ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flm_engine::meta::StopReason;

    #[derive(Default)]
    struct Capture {
        lines: Vec<(String, bool)>,
    }

    impl ChunkSender for &mut Capture {
        fn send(&mut self, payload: &str, is_final: bool) -> bool {
            self.lines.push((payload.to_string(), is_final));
            true
        }
    }

    #[test]
    fn test_generate_stream_shape() {
        let mut capture = Capture::default();
        {
            let mut stream = OllamaStream::new("llama3.2:1b", false, false, &mut capture);
            assert!(stream.push("Hel"));
            assert!(stream.push("lo"));
            let meta = ChatMeta {
                prompt_tokens: 3,
                generated_tokens: 2,
                total_duration: 100,
                stop_reason: StopReason::EndOfSequence,
                ..Default::default()
            };
            stream.finalize_generate(&meta, &[11, 22]);
        }
        assert_eq!(capture.lines.len(), 3);
        for (line, is_final) in &capture.lines[..2] {
            let v: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
            assert_eq!(v["done"], false);
            assert!(v["response"].is_string());
            assert!(!is_final);
        }
        let (last, is_final) = capture.lines.last().unwrap();
        assert!(is_final);
        let v: serde_json::Value = serde_json::from_str(last.trim()).unwrap();
        assert_eq!(v["done"], true);
        assert_eq!(v["done_reason"], "stop");
        assert_eq!(v["context"], serde_json::json!([11, 22]));
        assert_eq!(v["prompt_eval_count"], 3);
    }

    #[test]
    fn test_chat_stream_routes_reasoning_to_thinking() {
        let mut capture = Capture::default();
        {
            let mut stream = OllamaStream::new("gpt-oss:20b", true, true, &mut capture);
            stream.push(flm_engine::template::REASONING_START_MARKER);
            stream.push("pondering");
            stream.push(flm_engine::template::REASONING_END_MARKER);
            stream.push("answer");
            stream.finalize_chat(&ChatMeta::default());
        }
        let bodies: Vec<serde_json::Value> = capture
            .lines
            .iter()
            .map(|(l, _)| serde_json::from_str(l.trim()).unwrap())
            .collect();
        // Markers are suppressed entirely.
        assert_eq!(bodies.len(), 3);
        assert_eq!(bodies[0]["message"]["thinking"], "pondering");
        assert_eq!(bodies[0]["message"]["content"], "");
        assert_eq!(bodies[1]["message"]["content"], "answer");
        assert_eq!(bodies[2]["done"], true);
    }

    #[test]
    fn test_chunks_concatenate_to_the_input() {
        let mut capture = Capture::default();
        let input = ["gré", "at ", "答案", "!"];
        {
            let mut stream = OllamaStream::new("m", false, false, &mut capture);
            for piece in input {
                assert!(stream.push(piece));
            }
            stream.finalize_generate(&ChatMeta::default(), &[]);
        }
        let mut assembled = String::new();
        for (line, _) in &capture.lines {
            let v: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
            assembled.push_str(v["response"].as_str().unwrap_or(""));
        }
        assert_eq!(assembled, input.concat());
    }
}
