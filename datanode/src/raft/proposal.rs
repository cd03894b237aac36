use tokio::sync::oneshot;
use tokio::sync::oneshot::Receiver;
use tokio::sync::oneshot::Sender;

use crate::container::applier::ApplyOutcome;
use crate::container::operation::Operation;
use crate::error::ProposeError;
use crate::term_index::TermIndex;

pub type ProposeResult = Result<ApplyOutcome, ProposeError>;

pub struct Proposal {
    pub data: Vec<u8>,
    // Set to the entry's TermIndex once appended to the leader's log.
    pub proposed: Option<TermIndex>,
    pub propose_success: Option<Sender<ProposeResult>>,
}

impl Proposal {
    pub fn normal(op: &Operation) -> Result<(Self, Receiver<ProposeResult>), ProposeError> {
        let data = op.encode().map_err(|e| ProposeError::Encode(e.to_string()))?;
        Ok(Self::raw(data))
    }

    /// Proposes an already encoded payload.
    pub fn raw(data: Vec<u8>) -> (Self, Receiver<ProposeResult>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            data,
            proposed: None,
            propose_success: Some(tx),
        };
        (proposal, rx)
    }

    pub fn complete(mut self, result: ProposeResult) {
        if let Some(sender) = self.propose_success.take() {
            let _ = sender.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_delivers_outcome() {
        let (proposal, mut rx) = Proposal::normal(&Operation::create_container(1)).unwrap();
        assert!(!proposal.data.is_empty());
        proposal.complete(Ok(ApplyOutcome::Applied));
        assert_eq!(rx.try_recv().unwrap(), Ok(ApplyOutcome::Applied));
    }

    #[test]
    fn test_dropped_proposal_closes_channel() {
        let (proposal, mut rx) = Proposal::raw(vec![1, 2, 3]);
        drop(proposal);
        assert!(rx.try_recv().is_err());
    }
}
