//! In-band sentinel detection on interpreter stdout.
//!
//! The interpreter prints a request token right before it blocks on stdin
//! and a received token once it has consumed a line. Both are removed from
//! the user-visible stream; the text around them is forwarded untouched.
//! Some interpreter builds announce input waits with informal phrases
//! instead, so any line containing a configured fallback phrase is treated
//! as a request and dropped as well.

use crate::config::SentinelConfig;

/// Control signal carried in the interpreter's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The program is about to read stdin.
    InputRequest,
    /// The program consumed the line it was waiting for.
    InputReceived,
}

/// Result of classifying one piece of output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Classified {
    /// The last control signal found in the chunk, if any.
    pub signal: Option<Signal>,
    /// User-visible text with sentinels removed.
    pub output: String,
}

impl Classified {
    pub fn is_empty(&self) -> bool {
        self.signal.is_none() && self.output.is_empty()
    }
}

/// Stateless classifier for complete chunks.
#[derive(Debug, Clone)]
pub struct SentinelFilter {
    input_request: String,
    input_received: String,
    fallback_phrases: Vec<String>,
}

impl SentinelFilter {
    pub fn new(config: &SentinelConfig) -> Self {
        Self {
            input_request: config.input_request.clone(),
            input_received: config.input_received.clone(),
            fallback_phrases: config.fallback_phrases.clone(),
        }
    }

    /// Split a chunk into its control signal and the text to forward.
    ///
    /// When both tokens occur, the one that appears last wins.
    pub fn classify(&self, chunk: &str) -> Classified {
        let request_at = chunk.rfind(&self.input_request);
        let received_at = chunk.rfind(&self.input_received);

        let mut signal = match (request_at, received_at) {
            (Some(request), Some(received)) if received > request => Some(Signal::InputReceived),
            (Some(_), _) => Some(Signal::InputRequest),
            (None, Some(_)) => Some(Signal::InputReceived),
            (None, None) => None,
        };

        let mut output = chunk.to_string();
        if request_at.is_some() {
            output = strip_token(&output, &self.input_request);
        }
        if received_at.is_some() {
            output = strip_token(&output, &self.input_received);
        }

        if self
            .fallback_phrases
            .iter()
            .any(|phrase| output.contains(phrase.as_str()))
        {
            let mut kept = String::with_capacity(output.len());
            for line in output.split_inclusive('\n') {
                if self
                    .fallback_phrases
                    .iter()
                    .any(|phrase| line.contains(phrase.as_str()))
                {
                    continue;
                }
                kept.push_str(line);
            }
            output = kept;
            if signal.is_none() {
                signal = Some(Signal::InputRequest);
            }
        }

        Classified { signal, output }
    }

    /// Length of the longest proper token prefix that ends `text`.
    fn partial_token_suffix(&self, text: &str) -> usize {
        [&self.input_request, &self.input_received]
            .iter()
            .map(|token| longest_prefix_suffix(text, token))
            .max()
            .unwrap_or(0)
    }
}

/// Remove every occurrence of `token`, taking a line break right after it along.
fn strip_token(text: &str, token: &str) -> String {
    text.replace(&format!("{}\r\n", token), "")
        .replace(&format!("{}\n", token), "")
        .replace(token, "")
}

fn longest_prefix_suffix(text: &str, token: &str) -> usize {
    let max = token.len().saturating_sub(1).min(text.len());
    (1..=max)
        .rev()
        .find(|&len| {
            let start = text.len() - len;
            text.is_char_boundary(start) && token.starts_with(&text[start..])
        })
        .unwrap_or(0)
}

/// Incremental wrapper around [`SentinelFilter`] for a byte stream.
///
/// Pipe reads split output at arbitrary byte offsets, so a token or a
/// multi-byte character may straddle two reads. The stream holds back an
/// incomplete UTF-8 sequence and any trailing text that could still grow
/// into a token.
#[derive(Debug)]
pub struct SentinelStream {
    filter: SentinelFilter,
    utf8_carry: Vec<u8>,
    pending: String,
}

impl SentinelStream {
    pub fn new(filter: SentinelFilter) -> Self {
        Self {
            filter,
            utf8_carry: Vec::new(),
            pending: String::new(),
        }
    }

    /// Feed the next read from the pipe.
    pub fn push(&mut self, bytes: &[u8]) -> Classified {
        let decoded = self.decode(bytes);
        self.pending.push_str(&decoded);

        let held = self.filter.partial_token_suffix(&self.pending);
        let split = self.pending.len() - held;
        let tail = self.pending.split_off(split);
        let ready = std::mem::replace(&mut self.pending, tail);

        self.filter.classify(&ready)
    }

    /// Flush everything still held back once the pipe is closed.
    pub fn finish(&mut self) -> Classified {
        let mut rest = std::mem::take(&mut self.pending);
        if !self.utf8_carry.is_empty() {
            rest.push_str(&String::from_utf8_lossy(&self.utf8_carry));
            self.utf8_carry.clear();
        }
        self.filter.classify(&rest)
    }

    fn decode(&mut self, bytes: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.utf8_carry);
        buf.extend_from_slice(bytes);

        let mut out = String::with_capacity(buf.len());
        let mut rest: &[u8] = &buf;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.utf8_carry = rest.to_vec();
        out
    }
}
