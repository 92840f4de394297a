use std::ops::ControlFlow;
use std::time::Instant;

use anyhow::Result;
use log::debug;

use crate::error::GenerationError;
use crate::models::DecoderStack;
use crate::sampler::Sampler;

/// Progress reported while tokens are processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationEvent {
    /// An input token at `position` was processed without producing output.
    Progress { position: usize },
    /// A new token was generated; it will occupy `position` once fed back.
    Token { token: usize, position: usize },
}

/// Position and pending token of one conversation with a decoder stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationSession {
    /// Number of positions already processed by the stack.
    pub position: usize,
    /// Last generated token, not yet processed.
    pub last_token: Option<usize>,
}

/// Drives a decoder stack token by token and samples new tokens.
#[derive(Debug)]
pub struct Generator {
    stack: DecoderStack,
    sampler: Sampler,
    length_limit: usize,
}

impl Generator {
    pub fn new(stack: DecoderStack, sampler: Sampler, length_limit: usize) -> Self {
        Self { stack, sampler, length_limit }
    }

    pub fn stack(&self) -> &DecoderStack {
        &self.stack
    }

    /// Processes `input` and generates new tokens until end-of-text, the length limit or
    /// the context limit is reached, or the callback breaks.
    ///
    /// An empty input is replaced by the end-of-text token. Returns the generated tokens.
    pub fn process<F>(&mut self, session: &mut GenerationSession, input: &[usize], mut on_event: F) -> Result<Vec<usize>>
    where
        F: FnMut(GenerationEvent) -> ControlFlow<()>,
    {
        let end_of_text = self.stack.config().end_of_text_token;
        let tokens = if input.is_empty() { vec![end_of_text] } else { input.to_vec() };

        self.validate(session, &tokens)?;

        let Some((&last, prefix)) = tokens.split_last() else {
            return Ok(Vec::new());
        };

        session.last_token = None;

        // input tokens only fill the caches
        for &token in prefix {
            self.stack.execute_token(session.position, token, false);
            session.position += 1;

            if on_event(GenerationEvent::Progress { position: session.position - 1 }).is_break() {
                return Ok(Vec::new());
            }
        }

        let context = self.stack.context_size().unwrap_or(usize::MAX);
        let mut metrics = TokenMetrics::new();
        let mut generated = Vec::new();
        let mut token = last;

        loop {
            let hidden = self.stack.execute_token(session.position, token, true);
            session.position += 1;

            let next = self.sampler.sample(&self.stack.logits(&hidden));
            metrics.increment_token();

            generated.push(next);
            session.last_token = Some(next);

            let flow = on_event(GenerationEvent::Token { token: next, position: session.position });

            if next == end_of_text || generated.len() >= self.length_limit || session.position >= context || flow.is_break()
            {
                break;
            }

            token = next;
        }

        metrics.report();

        Ok(generated)
    }

    /// Feeds the last generated token back and keeps generating.
    pub fn continue_session<F>(&mut self, session: &mut GenerationSession, on_event: F) -> Result<Vec<usize>>
    where
        F: FnMut(GenerationEvent) -> ControlFlow<()>,
    {
        let token = session.last_token.ok_or(GenerationError::NothingToContinue)?;
        self.process(session, &[token], on_event)
    }

    /// Starts over: drops every cached position and resets the session.
    pub fn clear(&mut self, session: &mut GenerationSession) {
        self.stack.clear();
        *session = GenerationSession::default();
    }

    fn validate(&self, session: &GenerationSession, tokens: &[usize]) -> Result<(), GenerationError> {
        let cached = self.stack.cached_positions();
        if session.position != cached {
            return Err(GenerationError::SessionMismatch { session: session.position, cached });
        }

        let vocab_size = self.stack.config().vocab_size;
        if let Some(&token) = tokens.iter().find(|&&token| token >= vocab_size) {
            return Err(GenerationError::TokenOutOfRange { token, vocab_size });
        }

        if let Some(context) = self.stack.context_size() {
            if session.position + tokens.len() > context {
                return Err(GenerationError::ContextExceeded { position: session.position, input: tokens.len(), context });
            }
        }

        Ok(())
    }
}

/// Tracks token generation performance metrics
struct TokenMetrics {
    start_time: Instant,
    generated_count: usize,
}

impl TokenMetrics {
    fn new() -> Self {
        Self { start_time: Instant::now(), generated_count: 0 }
    }

    fn increment_token(&mut self) {
        self.generated_count += 1;
    }

    fn report(&self) {
        let duration = self.start_time.elapsed();
        if self.generated_count > 0 && duration.as_secs_f64() > 0.0 {
            let tps = self.generated_count as f64 / duration.as_secs_f64();
            debug!("Generated {} tokens in {:.2}s - {:.2} tokens/sec", self.generated_count, duration.as_secs_f64(), tps);
        }
    }
}
