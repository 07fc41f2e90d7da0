//! Token model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The session unit: a signed access/refresh token pair and the session ids
/// binding each token to its session store entry.
///
/// Results of token validation only populate the session id, user id and
/// token string of the validated side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDetail {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub access_session_id: String,
    #[serde(default)]
    pub refresh_session_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub access_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub refresh_expires_at: Option<DateTime<Utc>>,
}

impl TokenDetail {
    /// Remaining lifetime of the access token, zero when unknown or elapsed
    pub fn access_ttl(&self, now: DateTime<Utc>) -> Duration {
        remaining(self.access_expires_at, now)
    }

    /// Remaining lifetime of the refresh token, zero when unknown or elapsed
    pub fn refresh_ttl(&self, now: DateTime<Utc>) -> Duration {
        remaining(self.refresh_expires_at, now)
    }
}

fn remaining(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    expires_at
        .and_then(|at| (at - now).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_ttl() {
        let now = Utc::now();
        let detail = TokenDetail {
            access_expires_at: Some(now + chrono::Duration::seconds(90)),
            refresh_expires_at: Some(now - chrono::Duration::seconds(1)),
            ..Default::default()
        };

        assert_eq!(detail.access_ttl(now), Duration::from_secs(90));
        assert_eq!(detail.refresh_ttl(now), Duration::ZERO);
        assert_eq!(TokenDetail::default().access_ttl(now), Duration::ZERO);
    }
}
