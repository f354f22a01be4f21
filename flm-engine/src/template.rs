//! Chat templates and stop tokens per model family.
//!
//! Templates turn a role/content message list into the token stream the
//! model was trained on. Harmony-style models expose a hidden reasoning
//! channel through marker tokens; the markers live here so the streaming
//! filter and the templates stay in sync.

use serde::{Deserialize, Serialize};

/// Marker opening the hidden reasoning channel.
pub const REASONING_START_MARKER: &str = "<|start|>assistant<|channel|>analysis<|message|>";
/// Marker switching to the visible response channel.
pub const REASONING_END_MARKER: &str = "<|start|>assistant<|channel|>final<|message|>";
/// Special tokens are delimited by this pair.
pub const SPECIAL_TOKEN_OPEN: &str = "<|";
pub const SPECIAL_TOKEN_CLOSE: &str = "|>";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

/// Model families with distinct prompt formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatFamily {
    Llama,
    Gemma,
    Qwen,
    Harmony,
}

impl ChatFamily {
    /// Classify from the config's `model_type`.
    pub fn from_model_type(model_type: &str) -> Self {
        let lower = model_type.to_ascii_lowercase();
        if lower.contains("gemma") {
            Self::Gemma
        } else if lower.contains("qwen") {
            Self::Qwen
        } else if lower.contains("gpt_oss") || lower.contains("gpt-oss") || lower.contains("harmony")
        {
            Self::Harmony
        } else {
            Self::Llama
        }
    }

    /// Textual stop markers the tokenizer maps to stop ids.
    pub fn stop_strings(self) -> &'static [&'static str] {
        match self {
            Self::Llama => &["<|eot_id|>", "<|end_of_text|>"],
            Self::Gemma => &["<end_of_turn>", "<eos>"],
            Self::Qwen => &["<|im_end|>", "<|endoftext|>"],
            Self::Harmony => &["<|return|>", "<|endoftext|>"],
        }
    }
}

/// Render a message list into the family's prompt format, ending with the
/// generation prompt for the assistant turn.
pub fn apply_chat_template(
    family: ChatFamily,
    messages: &[Message],
    enable_think: bool,
) -> String {
    match family {
        ChatFamily::Llama => {
            let mut out = String::from("<|begin_of_text|>");
            for msg in messages {
                out.push_str("<|start_header_id|>");
                out.push_str(&msg.role);
                out.push_str("<|end_header_id|>\n\n");
                out.push_str(&msg.content);
                out.push_str("<|eot_id|>");
            }
            out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
            out
        }
        ChatFamily::Gemma => {
            // Gemma folds the system prompt into the first user turn and
            // names the assistant turn `model`.
            let mut out = String::from("<bos>");
            let mut system = String::new();
            for msg in messages {
                if msg.role == "system" {
                    system = msg.content.clone();
                    continue;
                }
                let role = if msg.role == "assistant" { "model" } else { "user" };
                out.push_str("<start_of_turn>");
                out.push_str(role);
                out.push('\n');
                if role == "user" && !system.is_empty() {
                    out.push_str(&system);
                    out.push_str("\n\n");
                    system.clear();
                }
                out.push_str(&msg.content);
                out.push_str("<end_of_turn>\n");
            }
            out.push_str("<start_of_turn>model\n");
            out
        }
        ChatFamily::Qwen => {
            let mut out = String::new();
            for msg in messages {
                out.push_str("<|im_start|>");
                out.push_str(&msg.role);
                out.push('\n');
                out.push_str(&msg.content);
                out.push_str("<|im_end|>\n");
            }
            out.push_str("<|im_start|>assistant\n");
            if !enable_think {
                out.push_str("<think>\n\n</think>\n\n");
            }
            out
        }
        ChatFamily::Harmony => {
            let mut out = String::new();
            for msg in messages {
                out.push_str("<|start|>");
                out.push_str(&msg.role);
                out.push_str("<|message|>");
                out.push_str(&msg.content);
                out.push_str("<|end|>");
            }
            if enable_think {
                out.push_str(REASONING_START_MARKER);
            } else {
                out.push_str(REASONING_END_MARKER);
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_classification() {
        assert_eq!(ChatFamily::from_model_type("llama"), ChatFamily::Llama);
        assert_eq!(ChatFamily::from_model_type("gemma3_text"), ChatFamily::Gemma);
        assert_eq!(ChatFamily::from_model_type("qwen3"), ChatFamily::Qwen);
        assert_eq!(ChatFamily::from_model_type("gpt_oss"), ChatFamily::Harmony);
        // Unknown families take the llama layout.
        assert_eq!(ChatFamily::from_model_type("mystery"), ChatFamily::Llama);
    }

    #[test]
    fn test_llama_template_shape() {
        let rendered = apply_chat_template(
            ChatFamily::Llama,
            &[
                Message::new("system", "Be brief."),
                Message::new("user", "Hello"),
            ],
            false,
        );
        assert!(rendered.starts_with("<|begin_of_text|>"));
        assert!(rendered.contains("<|start_header_id|>user<|end_header_id|>\n\nHello<|eot_id|>"));
        assert!(rendered.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn test_gemma_folds_system_into_first_user_turn() {
        let rendered = apply_chat_template(
            ChatFamily::Gemma,
            &[
                Message::new("system", "Be brief."),
                Message::new("user", "Hello"),
            ],
            false,
        );
        assert!(rendered.contains("<start_of_turn>user\nBe brief.\n\nHello<end_of_turn>"));
        assert!(rendered.ends_with("<start_of_turn>model\n"));
        assert!(!rendered.contains("system"));
    }

    #[test]
    fn test_qwen_think_switch() {
        let off = apply_chat_template(ChatFamily::Qwen, &[Message::new("user", "hi")], false);
        assert!(off.contains("<think>\n\n</think>"));
        let on = apply_chat_template(ChatFamily::Qwen, &[Message::new("user", "hi")], true);
        assert!(!on.contains("<think>"));
    }

    #[test]
    fn test_harmony_opens_requested_channel() {
        let think = apply_chat_template(ChatFamily::Harmony, &[Message::new("user", "hi")], true);
        assert!(think.ends_with(REASONING_START_MARKER));
        let plain = apply_chat_template(ChatFamily::Harmony, &[Message::new("user", "hi")], false);
        assert!(plain.ends_with(REASONING_END_MARKER));
    }
}
