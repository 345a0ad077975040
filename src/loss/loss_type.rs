use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Deserialize};

use crate::error::OutputError;

/// Loss identifier as written in a layer configuration.
///
/// - `Ce`:             softmax cross-entropy, scaled by the truncation norm.
/// - `Entropy`:        per batch column: cross-entropy if the column has a
///   positive label, otherwise the entropy of the prediction.
/// - `Sse`:            squared error on the raw scores.
/// - `Priori`:         cross-entropy on softmax divided by a learned class prior.
/// - `Decode`:         mean cross-entropy over decoder score streams.
/// - `Ctc`:            CTC with an external forward-backward procedure.
/// - `CeCtc`:          framewise cross-entropy against CTC-style frame labels.
/// - `Ctc2`:           self-contained log-domain CTC.
/// - `Sprint`:         externally computed forced-alignment error signal.
/// - `SprintSmoothed`: `Sprint` blended with a prior-shifted cross-entropy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossType {
    Ce,
    Entropy,
    Sse,
    Priori,
    Decode,
    Ctc,
    CeCtc,
    Ctc2,
    Sprint,
    SprintSmoothed,
}

impl LossType {
    pub const ALL: [LossType; 10] = [
        LossType::Ce,
        LossType::Entropy,
        LossType::Sse,
        LossType::Priori,
        LossType::Decode,
        LossType::Ctc,
        LossType::CeCtc,
        LossType::Ctc2,
        LossType::Sprint,
        LossType::SprintSmoothed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LossType::Ce => "ce",
            LossType::Entropy => "entropy",
            LossType::Sse => "sse",
            LossType::Priori => "priori",
            LossType::Decode => "decode",
            LossType::Ctc => "ctc",
            LossType::CeCtc => "ce_ctc",
            LossType::Ctc2 => "ctc2",
            LossType::Sprint => "sprint",
            LossType::SprintSmoothed => "sprint_smoothed",
        }
    }

    /// True for losses evaluated over whole sequences rather than per frame.
    pub fn is_sequence_level(&self) -> bool {
        matches!(
            self,
            LossType::Ctc | LossType::CeCtc | LossType::Ctc2 | LossType::Sprint | LossType::SprintSmoothed
        )
    }
}

impl fmt::Display for LossType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LossType {
    type Err = OutputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LossType::ALL
            .iter()
            .find(|l| l.as_str() == s)
            .copied()
            .ok_or_else(|| OutputError::UnknownLoss(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_round_trip_through_strings() {
        for loss in LossType::ALL {
            assert_eq!(loss.as_str().parse::<LossType>().unwrap(), loss);
            let json = serde_json::to_string(&loss).unwrap();
            assert_eq!(json, format!("\"{}\"", loss.as_str()));
        }
    }

    #[test]
    fn unknown_identifier_is_rejected() {
        assert!(matches!("mse".parse::<LossType>(), Err(OutputError::UnknownLoss(s)) if s == "mse"));
        assert!(serde_json::from_str::<LossType>("\"hinge\"").is_err());
    }
}
