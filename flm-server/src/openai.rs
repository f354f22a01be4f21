//! OpenAI-style streaming wire format (`text/event-stream`).
//!
//! Every event is a `data: {json}\n\n` frame. The last content-bearing
//! chunk is followed by one carrying `finish_reason` and the usage block,
//! then the literal `data: [DONE]` terminator.

use rand::Rng;
use serde_json::json;

use flm_engine::meta::ChatMeta;
use flm_engine::TokenSink;

use crate::filter::{Channel, HarmonyFilter, Utf8Gate};
use crate::http::ChunkSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAiMode {
    Chat,
    Completion,
}

fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect()
}

/// Identifier for a chat completion stream.
pub fn stream_id(mode: OpenAiMode) -> String {
    match mode {
        OpenAiMode::Chat => format!("chatcmpl-{}", random_hex(24)),
        OpenAiMode::Completion => format!("cmpl-{}", random_hex(24)),
    }
}

pub fn system_fingerprint() -> String {
    format!("fp_{}", random_hex(16))
}

pub struct OpenAiStream<S> {
    id: String,
    created: i64,
    fingerprint: String,
    model: String,
    mode: OpenAiMode,
    utf8: Utf8Gate,
    harmony: Option<HarmonyFilter>,
    sender: S,
    failed: bool,
}

impl<S: ChunkSender> OpenAiStream<S> {
    pub fn new(model: &str, mode: OpenAiMode, harmony: bool, sender: S) -> Self {
        Self {
            id: stream_id(mode),
            created: chrono::Utc::now().timestamp(),
            fingerprint: system_fingerprint(),
            model: model.to_string(),
            mode,
            utf8: Utf8Gate::new(),
            harmony: harmony.then(HarmonyFilter::new),
            sender,
            failed: false,
        }
    }

    fn send_event(&mut self, body: &serde_json::Value, is_final: bool) -> bool {
        let ok = self.sender.send(&format!("data: {body}\n\n"), is_final);
        if !ok {
            self.failed = true;
        }
        ok
    }

    fn emit(&mut self, fragment: &str) -> bool {
        if fragment.is_empty() {
            return true;
        }
        let (content, reasoning) = match self.harmony.as_mut() {
            Some(filter) => match filter.classify(fragment) {
                Channel::Template => return true,
                Channel::Reasoning => (String::new(), fragment.to_string()),
                Channel::Response => (fragment.to_string(), String::new()),
            },
            None => (fragment.to_string(), String::new()),
        };
        let body = match self.mode {
            OpenAiMode::Chat => json!({
                "id": self.id,
                "object": "chat.completion.chunk",
                "created": self.created,
                "model": self.model,
                "system_fingerprint": self.fingerprint,
                "choices": [{
                    "index": 0,
                    "delta": {
                        "role": "assistant",
                        "content": content,
                        "reasoning_content": reasoning,
                    },
                    "finish_reason": null,
                }],
            }),
            OpenAiMode::Completion => json!({
                "id": self.id,
                "object": "text_completion",
                "created": self.created,
                "system_fingerprint": self.fingerprint,
                "model": self.model,
                "choices": [{
                    "text": content,
                    "index": 0,
                    "logprobs": null,
                    "finish_reason": null,
                }],
            }),
        };
        self.send_event(&body, false)
    }

    /// Usage block shared by the final chunk and non-streaming responses.
    pub fn usage_json(meta: &ChatMeta) -> serde_json::Value {
        json!({
            "prompt_tokens": meta.prompt_tokens,
            "completion_tokens": meta.generated_tokens,
            "total_tokens": meta.prompt_tokens + meta.generated_tokens,
            "load_duration": meta.load_duration as f64 / 1e9,
            "prefill_duration_ttft": meta.prefill_duration as f64 / 1e9,
            "decoding_duration": meta.decoding_duration as f64 / 1e9,
            "prefill_speed_tps": meta.prefill_speed_tps(),
            "decoding_speed_tps": meta.decoding_speed_tps(),
        })
    }

    /// Finish chunk plus the `[DONE]` terminator.
    pub fn finalize(&mut self, meta: &ChatMeta) {
        let tail = self.utf8.finalize();
        if !tail.is_empty() {
            self.emit(&tail);
        }
        let finish = meta.stop_reason.as_str();
        let body = match self.mode {
            OpenAiMode::Chat => json!({
                "id": self.id,
                "object": "chat.completion.chunk",
                "created": self.created,
                "model": self.model,
                "system_fingerprint": self.fingerprint,
                "choices": [{
                    "index": 0,
                    "delta": { "content": null },
                    "finish_reason": finish,
                }],
                "usage": Self::usage_json(meta),
            }),
            OpenAiMode::Completion => json!({
                "id": self.id,
                "object": "text_completion",
                "created": self.created,
                "system_fingerprint": self.fingerprint,
                "model": self.model,
                "choices": [{ "finish_reason": finish }],
                "usage": Self::usage_json(meta),
            }),
        };
        self.send_event(&body, false);
        let terminated = self.sender.send("data: [DONE]\n\n", true);
        if !terminated {
            self.failed = true;
        }
    }

    /// Terminal event for a generation that died after headers went out.
    pub fn fail(&mut self, message: &str) {
        let body = json!({
            "error": { "message": message, "type": "server_error" },
        });
        self.send_event(&body, false);
        self.sender.send("data: [DONE]\n\n", true);
    }

    pub fn failed(&self) -> bool {
        self.failed
    }
}

impl<S: ChunkSender> TokenSink for OpenAiStream<S> {
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
        events: Vec<(String, bool)>,
    }

    impl ChunkSender for &mut Capture {
        fn send(&mut self, payload: &str, is_final: bool) -> bool {
            self.events.push((payload.to_string(), is_final));
            true
        }
    }

    fn body_of(event: &str) -> serde_json::Value {
        let data = event.strip_prefix("data: ").unwrap().trim();
        serde_json::from_str(data).unwrap()
    }

    #[test]
    fn test_chat_stream_ends_with_done_marker() {
        let mut capture = Capture::default();
        {
            let mut stream = OpenAiStream::new("llama3.2:1b", OpenAiMode::Chat, false, &mut capture);
            stream.push("hi");
            let meta = ChatMeta {
                prompt_tokens: 2,
                generated_tokens: 1,
                stop_reason: StopReason::LengthLimit,
                ..Default::default()
            };
            stream.finalize(&meta);
        }
        assert_eq!(capture.events.len(), 3);
        let first = body_of(&capture.events[0].0);
        assert_eq!(first["object"], "chat.completion.chunk");
        assert_eq!(first["choices"][0]["delta"]["content"], "hi");
        assert!(first["id"].as_str().unwrap().starts_with("chatcmpl-"));

        let finish = body_of(&capture.events[1].0);
        assert_eq!(finish["choices"][0]["finish_reason"], "length");
        assert_eq!(finish["usage"]["total_tokens"], 3);

        let (last, is_final) = capture.events.last().unwrap();
        assert_eq!(last, "data: [DONE]\n\n");
        assert!(is_final);
    }

    #[test]
    fn test_completion_mode_uses_text_field() {
        let mut capture = Capture::default();
        {
            let mut stream =
                OpenAiStream::new("llama3.2:1b", OpenAiMode::Completion, false, &mut capture);
            stream.push("2+2=4");
            stream.finalize(&ChatMeta::default());
        }
        let first = body_of(&capture.events[0].0);
        assert_eq!(first["object"], "text_completion");
        assert_eq!(first["choices"][0]["text"], "2+2=4");
    }

    #[test]
    fn test_identifiers_have_expected_shape() {
        assert_eq!(stream_id(OpenAiMode::Chat).len(), "chatcmpl-".len() + 24);
        assert!(system_fingerprint().starts_with("fp_"));
        assert_eq!(system_fingerprint().len(), 3 + 16);
    }
}
