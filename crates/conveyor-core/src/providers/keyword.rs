//! Keyword format: `KEY=VALUE,KEY=VALUE,...` lines.

use std::collections::VecDeque;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::sync::Mutex;

use super::{ExternalLine, IntakeProvider, OutputProvider, RawItem};
use crate::item::{Item, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordFormat {
    pub item_separator: char,
    pub key_value_separator: char,
    /// Trim whitespace around keys and values on intake.
    pub trim: bool,
}

impl Default for KeywordFormat {
    fn default() -> Self {
        Self {
            item_separator: ',',
            key_value_separator: '=',
            trim: true,
        }
    }
}

impl KeywordFormat {
    pub fn tokenize(&self, line: &str) -> Vec<String> {
        line.split(self.item_separator)
            .filter(|token| !token.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    /// `KEY=VALUE` gives a valued item; a bare `KEY` gives a key without value.
    pub fn parse_token(&self, token: &str) -> Option<RawItem> {
        let (key, text) = match token.split_once(self.key_value_separator) {
            Some((key, value)) => (key, Some(value)),
            None => (token, None),
        };
        let (key, text) = if self.trim {
            (key.trim(), text.map(str::trim))
        } else {
            (key, text)
        };
        if key.is_empty() {
            return None;
        }
        Some(RawItem::new(key, text.map(str::to_string)))
    }

    pub fn format_item(&self, item: &Item) -> String {
        match item.value() {
            Value::Void => String::new(),
            Value::Null => item.key().to_string(),
            _ => format!("{}{}{}", item.key(), self.key_value_separator, item.string_value()),
        }
    }

    pub fn join(&self, tokens: Vec<String>) -> String {
        let mut sep = [0u8; 4];
        let sep = self.item_separator.encode_utf8(&mut sep);
        tokens
            .into_iter()
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(sep)
    }
}

/// Reads keyword lines from one or more files; the n-th file is source n.
pub struct KeywordIntake {
    format: KeywordFormat,
    paths: Vec<PathBuf>,
    readers: VecDeque<(usize, Lines<BufReader<File>>)>,
}

impl KeywordIntake {
    pub fn new(paths: Vec<PathBuf>, format: KeywordFormat) -> Self {
        Self {
            format,
            paths,
            readers: VecDeque::new(),
        }
    }
}

#[async_trait]
impl IntakeProvider for KeywordIntake {
    async fn initialize(&mut self) -> anyhow::Result<()> {
        if self.paths.is_empty() {
            anyhow::bail!("no intake files configured");
        }
        for (index, path) in self.paths.iter().enumerate() {
            let file = File::open(path)
                .await
                .with_context(|| format!("Failed to open intake file {}", path.display()))?;
            self.readers.push_back((index + 1, BufReader::new(file).lines()));
        }
        tracing::debug!(sources = self.paths.len(), "keyword intake opened");
        Ok(())
    }

    async fn get_line(&mut self) -> anyhow::Result<Option<ExternalLine>> {
        while let Some((source_no, lines)) = self.readers.front_mut() {
            match lines.next_line().await? {
                Some(text) if text.trim().is_empty() => continue,
                Some(text) => return Ok(Some(ExternalLine::new(text, *source_no))),
                None => {
                    self.readers.pop_front();
                },
            }
        }
        Ok(None)
    }

    fn tokenize(&self, line: &str) -> Vec<String> {
        self.format.tokenize(line)
    }

    fn item_from_token(&mut self, token: &str, _ordinal: usize) -> anyhow::Result<Option<RawItem>> {
        Ok(self.format.parse_token(token))
    }

    async fn dispose(&mut self) {
        self.readers.clear();
    }
}

/// Writes keyword lines to files; target n is the n-th file.
pub struct KeywordOutput {
    format: KeywordFormat,
    paths: Vec<PathBuf>,
    writers: Mutex<Vec<BufWriter<File>>>,
}

impl KeywordOutput {
    pub fn new(paths: Vec<PathBuf>, format: KeywordFormat) -> Self {
        Self {
            format,
            paths,
            writers: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl OutputProvider for KeywordOutput {
    async fn initialize(&self) -> anyhow::Result<()> {
        if self.paths.is_empty() {
            anyhow::bail!("no output files configured");
        }
        let mut writers = self.writers.lock().await;
        for path in &self.paths {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create output file {}", path.display()))?;
            writers.push(BufWriter::new(file));
        }
        Ok(())
    }

    fn token_from_item(&self, item: &Item) -> anyhow::Result<String> {
        Ok(self.format.format_item(item))
    }

    fn join_tokens(&self, tokens: Vec<String>) -> anyhow::Result<String> {
        Ok(self.format.join(tokens))
    }

    async fn send_line(&self, line: String, target_no: usize) -> anyhow::Result<()> {
        let mut writers = self.writers.lock().await;
        let count = writers.len();
        let writer = target_no
            .checked_sub(1)
            .and_then(|index| writers.get_mut(index))
            .with_context(|| format!("No output target #{} (have {})", target_no, count))?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn complete(&self) -> anyhow::Result<()> {
        let mut writers = self.writers.lock().await;
        for writer in writers.iter_mut() {
            writer.flush().await?;
        }
        Ok(())
    }
}
