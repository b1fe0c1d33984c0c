//! Records received from the matching service, only used to learn who can be chatted with

use serde::{Deserialize, Serialize};

use super::address::Participant;

/// Public profile of a user as it is returned by the matching service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublicProfile {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub year: Option<String>,
    pub department: Option<String>,
    pub bio: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub interests: Vec<String>,
    pub personality: Option<String>,
}

/// A candidate peer with the compatibility score assigned by the matching service.
///
/// Scores are opaque, they are only used to rank candidates
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub user: PublicProfile,
    pub score: f64,
}

impl PublicProfile {
    /// Get the chat participant that this profile represents. Email addresses are normalized
    /// the same way the matching service stores them, so both sides address the same channel
    pub fn participant(&self) -> Participant {
        Participant::new(self.email.trim().to_lowercase(), self.name.trim())
    }
}

/// Parse a match listing, returning the candidates ordered from highest to lowest score.
/// Candidates with equal scores keep the order the service returned them in
pub fn parse_matches(json: &str) -> Result<Vec<MatchResult>, serde_json::Error> {
    let mut results = serde_json::from_str::<Vec<MatchResult>>(json)?;
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
    Ok(results)
}
