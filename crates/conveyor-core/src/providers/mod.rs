//! Intake and output providers.
//!
//! Providers own everything format- and I/O-specific. The engine only asks an
//! intake provider for lines and tokens, and an output provider for tokens,
//! joined lines and delivery.

pub mod keyword;
pub mod memory;

use async_trait::async_trait;

use crate::item::Item;

pub use keyword::{KeywordFormat, KeywordIntake, KeywordOutput};
pub use memory::{CollectedLines, CollectingOutput, ConsumerOutput, VecIntake};

/// One line of external data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalLine {
    pub text: String,
    /// 1-based number of the source the line came from.
    pub source_no: usize,
}

impl ExternalLine {
    pub fn new(text: impl Into<String>, source_no: usize) -> Self {
        Self {
            text: text.into(),
            source_no,
        }
    }
}

/// A field extracted from a token, before typing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawItem {
    pub key: String,
    /// `None` for a key present without a value.
    pub text: Option<String>,
}

impl RawItem {
    pub fn new(key: impl Into<String>, text: Option<String>) -> Self {
        Self {
            key: key.into(),
            text,
        }
    }
}

#[async_trait]
pub trait IntakeProvider: Send {
    /// Acquire resources. An error here ends the run with an initialization error.
    async fn initialize(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// The next line, or `None` once every source is exhausted.
    async fn get_line(&mut self) -> anyhow::Result<Option<ExternalLine>>;

    fn tokenize(&self, line: &str) -> Vec<String>;

    /// Extract a field from a token; `None` skips the token.
    fn item_from_token(&mut self, token: &str, ordinal: usize) -> anyhow::Result<Option<RawItem>>;

    /// Fields the provider knows about independently of the data (e.g. from a header row).
    fn fields_in_use(&self) -> Vec<String> {
        Vec::new()
    }

    fn has_header_row(&self) -> bool {
        false
    }

    fn header_row_complete(&self) -> bool {
        !self.has_header_row()
    }

    async fn dispose(&mut self) {}
}

#[async_trait]
pub trait OutputProvider: Send + Sync {
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Whether lines can only be produced once the full field list is known.
    fn requires_fields_up_front(&self) -> bool {
        false
    }

    /// Called once, when output is linked, with the fields to write.
    fn set_fields_to_use(&self, _fields: &[String]) {}

    fn token_from_item(&self, item: &Item) -> anyhow::Result<String>;

    fn join_tokens(&self, tokens: Vec<String>) -> anyhow::Result<String>;

    /// Deliver one line to target `target_no` (1-based).
    async fn send_line(&self, line: String, target_no: usize) -> anyhow::Result<()>;

    /// Flush and release targets after the last line.
    async fn complete(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
