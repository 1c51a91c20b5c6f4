//! Consensus-level rejection and wait outcomes

use thiserror::Error;

/// Why a vote or candidate was not recorded
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoteRejection {
    #[error("height already confirmed")]
    StaleVote,

    #[error("voter already voted in this stage")]
    DuplicateVote,

    #[error("voter is not a member of the round")]
    UnauthorizedVoter,

    #[error("signature does not verify")]
    BadSignature,

    #[error("malformed message")]
    Malformed,

    #[error("round cannot be computed")]
    UnknownRound,

    #[error("height or round too far ahead")]
    TooFarAhead,
}

/// Why a stage wait ended without a result
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageWait {
    #[error("stage timed out")]
    Timeout,

    #[error("round changed while waiting")]
    RoundChanged,
}
