//! Reassembly of fragmented tool-call deltas
//!
//! Providers stream tool calls as index-keyed fragments: the id and the
//! function name usually arrive once, while the JSON arguments arrive token
//! by token. Only the full concatenation of the argument fragments is valid
//! JSON, so nothing here parses arguments.

use std::collections::BTreeMap;

use crate::conversation::ToolCall;

#[derive(Debug, Default, Clone)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Merges tool-call deltas into complete calls
///
/// # Examples
///
/// ```
/// use forkchat::stream::ToolCallAccumulator;
///
/// let mut acc = ToolCallAccumulator::new();
/// acc.update(0, Some("call_1"), Some("lookup"), Some("{\"a\""));
/// acc.update(0, None, None, Some(":1}"));
/// let calls = acc.finalize();
/// assert_eq!(calls[0].arguments, "{\"a\":1}");
/// ```
#[derive(Debug, Default, Clone)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, PartialCall>,
}

impl ToolCallAccumulator {
    /// Creates an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one delta to the call at `index`
    ///
    /// `id` and `name` overwrite (last write wins); `arguments` is appended.
    pub fn update(
        &mut self,
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) {
        let call = self.calls.entry(index).or_default();
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            call.id = id.to_string();
        }
        if let Some(name) = name.filter(|s| !s.is_empty()) {
            call.name = name.to_string();
        }
        if let Some(fragment) = arguments {
            call.arguments.push_str(fragment);
        }
    }

    /// Whether any delta has been received
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Number of distinct call indices seen so far
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Returns the accumulated calls ordered by ascending index
    ///
    /// Only call this once the provider has signalled that the tool-call
    /// phase is over; earlier calls yield truncated argument strings.
    /// Malformed arguments are passed through untouched and surface later
    /// as tool-execution failures. Calls that never received a name are
    /// dropped; calls without an id get a synthetic one.
    pub fn finalize(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .filter_map(|(index, call)| {
                if call.name.is_empty() {
                    tracing::warn!(index, "Dropping tool call delta without a function name");
                    return None;
                }
                let id = if call.id.is_empty() {
                    format!("call_{}", index)
                } else {
                    call.id
                };
                Some(ToolCall {
                    id,
                    name: call.name,
                    arguments: call.arguments,
                })
            })
            .collect()
    }

    /// Finalizes and resets the accumulator in place
    pub fn take(&mut self) -> Vec<ToolCall> {
        std::mem::take(self).finalize()
    }
}
