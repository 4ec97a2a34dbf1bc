//! Ordered, named, cancellable stages over a shared context.
//!
//! A transaction commits its stages in order and then runs `cleanup` on
//! every stage it attempted, newest first, whatever the outcome. Errors and
//! panics raised by a stage are captured into its [`StageRecord`].

mod sink;

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use crate::error::Result;
use crate::model::{StageResult, VerificationResultType};

pub use sink::{ChannelSink, TracingSink, TransactionEvent, TransactionSink};

/// Implemented by `#[Stage(...)]`.
pub trait Named {
    fn id(&self) -> &'static str;
    fn label(&self) -> &'static str;
}

pub trait Stage<C>: Named {
    fn commit(&mut self, ctx: &mut C) -> Result<StageResult>;

    fn cleanup(&mut self, ctx: &mut C) -> Result<()> {
        let _ = ctx;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    StopOnFailure,
    ContinueOnFailure,
}

#[derive(Debug, Clone)]
pub struct StageRecord {
    pub id: &'static str,
    /// `None` when the stage errored or panicked.
    pub result: Option<StageResult>,
    pub error: Option<String>,
    pub elapsed_ms: u128,
}

impl StageRecord {
    pub fn effective_result(&self) -> VerificationResultType {
        self.result
            .as_ref()
            .map(|r| r.result)
            .unwrap_or(VerificationResultType::FailureUnrecoverable)
    }

    pub fn message(&self) -> Option<&str> {
        self.result
            .as_ref()
            .and_then(|r| r.message.as_deref())
            .or(self.error.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Halt {
    Completed,
    Failed { stage: &'static str },
    Cancelled { before: &'static str },
}

impl fmt::Display for Halt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Failed { stage } => write!(f, "failed at {stage}"),
            Self::Cancelled { before } => write!(f, "cancelled before {before}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransactionReport {
    pub name: String,
    pub records: Vec<StageRecord>,
    pub halt: Halt,
    pub elapsed_ms: u128,
}

impl TransactionReport {
    pub fn cancelled(&self) -> bool {
        matches!(self.halt, Halt::Cancelled { .. })
    }

    pub fn record(&self, id: &str) -> Option<&StageRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn failed_stages(&self) -> impl Iterator<Item = &StageRecord> {
        self.records
            .iter()
            .filter(|r| r.effective_result() != VerificationResultType::Success)
    }
}

type CancelCheck<C> = Box<dyn Fn(&C) -> bool + Send>;
type CancelHook<C> = Box<dyn FnMut(&mut C) + Send>;

pub struct Transaction<C> {
    name: String,
    policy: FailurePolicy,
    stages: Vec<Box<dyn Stage<C> + Send>>,
    cancel_check: Option<CancelCheck<C>>,
    on_cancel: Option<CancelHook<C>>,
    sink: Arc<dyn TransactionSink>,
}

impl<C> Transaction<C> {
    pub fn new(name: impl Into<String>, policy: FailurePolicy, sink: Arc<dyn TransactionSink>) -> Self {
        Self {
            name: name.into(),
            policy,
            stages: Vec::new(),
            cancel_check: None,
            on_cancel: None,
            sink,
        }
    }

    pub fn stage(mut self, stage: impl Stage<C> + Send + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Polled before every stage; `true` stops the transaction.
    pub fn cancel_when(mut self, check: impl Fn(&C) -> bool + Send + 'static) -> Self {
        self.cancel_check = Some(Box::new(check));
        self
    }

    /// Runs once when the cancel check fires.
    pub fn on_cancel(mut self, hook: impl FnMut(&mut C) + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(hook));
        self
    }

    pub fn commit(mut self, ctx: &mut C) -> TransactionReport {
        let started = Instant::now();
        self.sink.emit(TransactionEvent::Started {
            transaction: self.name.clone(),
            stages: self.stages.len(),
        });

        let mut records = Vec::with_capacity(self.stages.len());
        let mut attempted = Vec::with_capacity(self.stages.len());
        let mut halt = Halt::Completed;

        for (idx, stage) in self.stages.iter_mut().enumerate() {
            let id = stage.id();
            if self.cancel_check.as_ref().is_some_and(|check| check(ctx)) {
                halt = Halt::Cancelled { before: id };
                self.sink.emit(TransactionEvent::Cancelled {
                    transaction: self.name.clone(),
                    before: id,
                });
                if let Some(hook) = self.on_cancel.as_mut() {
                    hook(ctx);
                }
                break;
            }

            self.sink.emit(TransactionEvent::StageStarted {
                transaction: self.name.clone(),
                stage: id,
                label: stage.label(),
            });
            let t0 = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| stage.commit(ctx)));
            let (result, error) = match outcome {
                Ok(Ok(r)) => (Some(r), None),
                Ok(Err(e)) => (None, Some(e.to_string())),
                Err(panic) => (None, Some(format!("stage panicked: {}", panic_message(&*panic)))),
            };
            attempted.push(idx);
            let record = StageRecord {
                id,
                result,
                error,
                elapsed_ms: t0.elapsed().as_millis(),
            };
            let graded = record.effective_result();
            self.sink.emit(TransactionEvent::StageFinished {
                transaction: self.name.clone(),
                stage: id,
                result: graded,
                message: record.result.as_ref().and_then(|r| r.message.clone()),
                error: record.error.clone(),
                elapsed_ms: record.elapsed_ms,
            });
            records.push(record);

            if graded != VerificationResultType::Success && self.policy == FailurePolicy::StopOnFailure {
                halt = Halt::Failed { stage: id };
                break;
            }
        }

        for idx in attempted.into_iter().rev() {
            let stage = &mut self.stages[idx];
            let id = stage.id();
            let outcome = catch_unwind(AssertUnwindSafe(|| stage.cleanup(ctx)));
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(format!("cleanup panicked: {}", panic_message(&*panic))),
            };
            if let Some(error) = error {
                self.sink.emit(TransactionEvent::CleanupFailed {
                    transaction: self.name.clone(),
                    stage: id,
                    error,
                });
            }
        }

        let elapsed_ms = started.elapsed().as_millis();
        self.sink.emit(TransactionEvent::Finished {
            transaction: self.name.clone(),
            outcome: halt.to_string(),
            elapsed_ms,
        });
        TransactionReport {
            name: self.name,
            records,
            halt,
            elapsed_ms,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
