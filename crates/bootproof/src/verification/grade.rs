use crate::model::VerificationResultType;
use crate::transaction::StageRecord;

/// Highest-ranked result over the committed stages; the first stage wins a
/// tie. No stages at all is unrecoverable.
pub fn aggregate(records: &[StageRecord]) -> VerificationResultType {
    deciding_record(records)
        .map(StageRecord::effective_result)
        .unwrap_or(VerificationResultType::FailureUnrecoverable)
}

pub fn deciding_record(records: &[StageRecord]) -> Option<&StageRecord> {
    let mut best: Option<&StageRecord> = None;
    for r in records {
        let better = best.is_none_or(|b| r.effective_result().rank() > b.effective_result().rank());
        if better {
            best = Some(r);
        }
    }
    best
}
