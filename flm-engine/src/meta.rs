//! Per-request generation accounting.

/// Why a generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// The model emitted a stop token.
    #[default]
    EndOfSequence,
    /// `max_tokens` was reached.
    LengthLimit,
    /// The request's cancellation token fired (or the output stream failed).
    Cancelled,
    /// The context window is full.
    MaxContextReached,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EndOfSequence => "stop",
            Self::LengthLimit => "length",
            Self::Cancelled => "cancelled",
            Self::MaxContextReached => "max_context",
        }
    }
}

/// Token counts and nanosecond timings for one request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatMeta {
    pub prompt_tokens: u32,
    pub generated_tokens: u32,
    pub load_duration: u64,
    pub prefill_duration: u64,
    pub decoding_duration: u64,
    pub total_duration: u64,
    pub stop_reason: StopReason,
}

impl ChatMeta {
    /// Time to first token, in seconds.
    pub fn ttft_secs(&self) -> f64 {
        self.prefill_duration as f64 / 1e9
    }

    pub fn prefill_speed_tps(&self) -> f64 {
        if self.prefill_duration == 0 {
            return 0.0;
        }
        self.prompt_tokens as f64 / (self.prefill_duration as f64 / 1e9)
    }

    pub fn decoding_speed_tps(&self) -> f64 {
        if self.decoding_duration == 0 {
            return 0.0;
        }
        self.generated_tokens as f64 / (self.decoding_duration as f64 / 1e9)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_reason_wire_names() {
        assert_eq!(StopReason::EndOfSequence.as_str(), "stop");
        assert_eq!(StopReason::LengthLimit.as_str(), "length");
        assert_eq!(StopReason::Cancelled.as_str(), "cancelled");
        assert_eq!(StopReason::MaxContextReached.as_str(), "max_context");
    }

    #[test]
    fn test_speeds() {
        let meta = ChatMeta {
            prompt_tokens: 100,
            generated_tokens: 50,
            prefill_duration: 2_000_000_000,
            decoding_duration: 5_000_000_000,
            ..Default::default()
        };
        assert!((meta.prefill_speed_tps() - 50.0).abs() < 1e-9);
        assert!((meta.decoding_speed_tps() - 10.0).abs() < 1e-9);
        assert!((meta.ttft_secs() - 2.0).abs() < 1e-9);
    }
}
