use std::sync::mpsc;

use crate::model::VerificationResultType;

#[derive(Debug, Clone)]
pub enum TransactionEvent {
    Started {
        transaction: String,
        stages: usize,
    },
    StageStarted {
        transaction: String,
        stage: &'static str,
        label: &'static str,
    },
    StageFinished {
        transaction: String,
        stage: &'static str,
        result: VerificationResultType,
        message: Option<String>,
        error: Option<String>,
        elapsed_ms: u128,
    },
    Cancelled {
        transaction: String,
        before: &'static str,
    },
    CleanupFailed {
        transaction: String,
        stage: &'static str,
        error: String,
    },
    Finished {
        transaction: String,
        outcome: String,
        elapsed_ms: u128,
    },
}

pub trait TransactionSink: Send + Sync {
    fn emit(&self, ev: TransactionEvent);
}

/// Structured log lines for every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TransactionSink for TracingSink {
    fn emit(&self, ev: TransactionEvent) {
        match ev {
            TransactionEvent::Started {
                transaction,
                stages,
            } => tracing::debug!(%transaction, stages, "transaction started"),
            TransactionEvent::StageStarted {
                transaction,
                stage,
                label,
            } => tracing::info!(%transaction, stage, "{label}"),
            TransactionEvent::StageFinished {
                transaction,
                stage,
                result,
                message,
                error,
                elapsed_ms,
            } => {
                let elapsed_ms = elapsed_ms as u64;
                if let Some(error) = error {
                    tracing::error!(%transaction, stage, elapsed_ms, %error, "stage errored");
                } else if result == VerificationResultType::Success {
                    tracing::debug!(%transaction, stage, elapsed_ms, "stage succeeded");
                } else {
                    tracing::warn!(
                        %transaction,
                        stage,
                        elapsed_ms,
                        result = result.as_str(),
                        message = message.as_deref().unwrap_or(""),
                        "stage did not succeed"
                    );
                }
            }
            TransactionEvent::Cancelled {
                transaction,
                before,
            } => tracing::info!(%transaction, before, "transaction cancelled"),
            TransactionEvent::CleanupFailed {
                transaction,
                stage,
                error,
            } => tracing::warn!(%transaction, stage, %error, "stage cleanup failed"),
            TransactionEvent::Finished {
                transaction,
                outcome,
                elapsed_ms,
            } => tracing::info!(%transaction, %outcome, elapsed_ms = elapsed_ms as u64, "transaction finished"),
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<TransactionEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<TransactionEvent>) -> Self {
        Self { tx }
    }
}

impl TransactionSink for ChannelSink {
    fn emit(&self, ev: TransactionEvent) {
        let _ = self.tx.send(ev);
    }
}
