//! In-memory providers, using the keyword format for tokens.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::keyword::KeywordFormat;
use super::{ExternalLine, IntakeProvider, OutputProvider, RawItem};
use crate::item::Item;

/// Serves lines from memory.
#[derive(Debug, Clone, Default)]
pub struct VecIntake {
    lines: VecDeque<ExternalLine>,
    format: KeywordFormat,
}

impl VecIntake {
    /// A single source.
    pub fn new<S: Into<String>>(lines: impl IntoIterator<Item = S>) -> Self {
        Self::with_sources([lines])
    }

    /// Several sources read one after another; the n-th is source n.
    pub fn with_sources<S: Into<String>, L: IntoIterator<Item = S>>(
        sources: impl IntoIterator<Item = L>,
    ) -> Self {
        let lines = sources
            .into_iter()
            .enumerate()
            .flat_map(|(index, lines)| {
                lines
                    .into_iter()
                    .map(move |text| ExternalLine::new(text, index + 1))
            })
            .collect();
        Self {
            lines,
            format: KeywordFormat::default(),
        }
    }

    pub fn with_format(mut self, format: KeywordFormat) -> Self {
        self.format = format;
        self
    }
}

#[async_trait]
impl IntakeProvider for VecIntake {
    async fn get_line(&mut self) -> anyhow::Result<Option<ExternalLine>> {
        Ok(self.lines.pop_front())
    }

    fn tokenize(&self, line: &str) -> Vec<String> {
        self.format.tokenize(line)
    }

    fn item_from_token(&mut self, token: &str, _ordinal: usize) -> anyhow::Result<Option<RawItem>> {
        Ok(self.format.parse_token(token))
    }
}

/// Lines captured by a [`CollectingOutput`], grouped by target, plus the
/// field list the engine fixed for them.
#[derive(Debug, Clone, Default)]
pub struct CollectedLines {
    inner: Arc<Mutex<BTreeMap<usize, Vec<String>>>>,
    fields: Arc<Mutex<Option<Vec<String>>>>,
}

impl CollectedLines {
    /// Fields passed to `set_fields_to_use`, if it was called.
    pub fn fields(&self) -> Option<Vec<String>> {
        self.fields.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn push(&self, target_no: usize, line: String) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(target_no)
            .or_default()
            .push(line);
    }

    /// Lines sent to `target_no`, in arrival order.
    pub fn target(&self, target_no: usize) -> Vec<String> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&target_no)
            .cloned()
            .unwrap_or_default()
    }

    /// Every line, ordered by target and then by arrival.
    pub fn all(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn targets(&self) -> Vec<usize> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }
}

/// Captures output lines in memory.
#[derive(Debug, Default)]
pub struct CollectingOutput {
    format: KeywordFormat,
    lines: CollectedLines,
    fields_up_front: bool,
    completed: Mutex<bool>,
}

impl CollectingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Demand the full field list before output starts.
    pub fn requiring_fields_up_front(mut self) -> Self {
        self.fields_up_front = true;
        self
    }

    /// Shared handle to the captured lines; stays valid after the run.
    pub fn lines(&self) -> CollectedLines {
        self.lines.clone()
    }

    pub fn is_completed(&self) -> bool {
        *self.completed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl OutputProvider for CollectingOutput {
    fn requires_fields_up_front(&self) -> bool {
        self.fields_up_front
    }

    fn set_fields_to_use(&self, fields: &[String]) {
        *self.lines.fields.lock().unwrap_or_else(PoisonError::into_inner) = Some(fields.to_vec());
    }

    fn token_from_item(&self, item: &Item) -> anyhow::Result<String> {
        Ok(self.format.format_item(item))
    }

    fn join_tokens(&self, tokens: Vec<String>) -> anyhow::Result<String> {
        Ok(self.format.join(tokens))
    }

    async fn send_line(&self, line: String, target_no: usize) -> anyhow::Result<()> {
        self.lines.push(target_no, line);
        Ok(())
    }

    async fn complete(&self) -> anyhow::Result<()> {
        *self.completed.lock().unwrap_or_else(PoisonError::into_inner) = true;
        Ok(())
    }
}

pub type LineConsumer = Arc<dyn Fn(String, usize) -> anyhow::Result<()> + Send + Sync>;

/// Hands every output line to a caller closure.
pub struct ConsumerOutput {
    format: KeywordFormat,
    consumer: LineConsumer,
}

impl ConsumerOutput {
    pub fn new(consumer: impl Fn(String, usize) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        Self {
            format: KeywordFormat::default(),
            consumer: Arc::new(consumer),
        }
    }
}

#[async_trait]
impl OutputProvider for ConsumerOutput {
    fn token_from_item(&self, item: &Item) -> anyhow::Result<String> {
        Ok(self.format.format_item(item))
    }

    fn join_tokens(&self, tokens: Vec<String>) -> anyhow::Result<String> {
        Ok(self.format.join(tokens))
    }

    async fn send_line(&self, line: String, target_no: usize) -> anyhow::Result<()> {
        (self.consumer)(line, target_no)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_vec_intake_numbers_sources() {
        let mut intake = VecIntake::with_sources([vec!["A=1"], vec!["A=2", "A=3"]]);
        let mut seen = Vec::new();
        while let Some(line) = intake.get_line().await.unwrap() {
            seen.push((line.source_no, line.text));
        }
        assert_eq!(
            seen,
            vec![(1, "A=1".to_string()), (2, "A=2".to_string()), (2, "A=3".to_string())]
        );
    }

    #[tokio::test]
    async fn test_collecting_output_groups_by_target() {
        let output = CollectingOutput::new();
        let lines = output.lines();
        output.send_line("a".into(), 2).await.unwrap();
        output.send_line("b".into(), 1).await.unwrap();
        output.send_line("c".into(), 2).await.unwrap();
        output.complete().await.unwrap();

        assert_eq!(lines.target(2), vec!["a", "c"]);
        assert_eq!(lines.all(), vec!["b", "a", "c"]);
        assert_eq!(lines.targets(), vec![1, 2]);
        assert!(output.is_completed());
    }
}
