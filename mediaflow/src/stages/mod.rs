//! Stage trait and implementations.
//!
//! A stage is one unit of work in the pipeline chain. Stages run once per
//! attempt and report an [`ExitResult`]; retries, backoff and events are
//! handled by the [`crate::pipeline::StageRunner`], independent of what the
//! stage does.

mod command;
mod result;
mod tail;

pub use command::{AuxiliaryCommand, CommandSpec, CommandStage};
pub use result::ExitResult;
pub use tail::{tail_chars, OutputTail, DEFAULT_TAIL_LIMIT};

use crate::core::CompletionToken;
use async_trait::async_trait;
use std::fmt::Debug;

/// Trait for pipeline stages.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Executes one attempt of the stage.
    ///
    /// `input` is the completion token of the previous stage, `None` for the
    /// first stage of a run.
    async fn execute(&self, input: Option<&CompletionToken>) -> ExitResult;
}

/// A simple function-based stage.
pub struct FnStage<F>
where
    F: Fn(Option<&CompletionToken>) -> ExitResult + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(Option<&CompletionToken>) -> ExitResult + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(Option<&CompletionToken>) -> ExitResult + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(Option<&CompletionToken>) -> ExitResult + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: Option<&CompletionToken>) -> ExitResult {
        (self.func)(input)
    }
}
