use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::{ConnectError, ListingError};
use super::models::Credential;
use super::remote::{ListingAuth, MountAuth, RemoteAdapter};
use super::share::{Share, parse_share_listing};

pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

const GUEST_ACCOUNT: &str = "guest";

/// Credential variant tried against a host, in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Username without its domain prefix.
    StrippedUser,
    /// Username exactly as entered, when it differs from the stripped form.
    QualifiedUser,
    /// Unauthenticated listing.
    Guest,
}

/// Shares found on a host and the strategy that found them.
#[derive(Debug, Clone)]
pub struct Enumeration {
    pub host: String,
    pub shares: Vec<Share>,
    pub strategy: Strategy,
    pub auth: MountAuth,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectorOptions {
    pub backoff: Duration,
    pub max_attempts: usize,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Discovers mountable shares, falling back across credential variants.
pub struct ShareConnector {
    adapter: Arc<dyn RemoteAdapter>,
    options: ConnectorOptions,
}

impl ShareConnector {
    pub fn new(adapter: Arc<dyn RemoteAdapter>, options: ConnectorOptions) -> Self {
        Self { adapter, options }
    }

    pub fn strategies(credential: &Credential) -> Vec<(Strategy, ListingAuth)> {
        let mut strategies = Vec::with_capacity(3);
        let stripped = credential.normalized_username();

        if !stripped.is_empty() {
            strategies.push((
                Strategy::StrippedUser,
                ListingAuth::User {
                    username: stripped.to_string(),
                    secret: credential.secret.clone(),
                },
            ));
            if credential.username != stripped {
                strategies.push((
                    Strategy::QualifiedUser,
                    ListingAuth::User {
                        username: credential.username.clone(),
                        secret: credential.secret.clone(),
                    },
                ));
            }
        }
        strategies.push((Strategy::Guest, ListingAuth::Guest));
        strategies
    }

    /// Try each strategy in order and return the first successful listing.
    ///
    /// A recoverable failure is followed by a fixed backoff before the next
    /// strategy. When every attempt fails, the last error is returned.
    pub async fn enumerate(
        &self,
        host: &str,
        credential: &Credential,
    ) -> Result<Enumeration, ConnectError> {
        let attempts: Vec<_> = Self::strategies(credential)
            .into_iter()
            .take(self.options.max_attempts)
            .collect();
        let total = attempts.len();
        let mut last_error: Option<ListingError> = None;

        for (index, (strategy, auth)) in attempts.into_iter().enumerate() {
            debug!(host, ?strategy, ?auth, "Listing shares");

            match self.adapter.list_shares(host, &auth).await {
                Ok(output) => {
                    let shares = parse_share_listing(&output, host);
                    info!(host, ?strategy, shares = shares.len(), "Enumerated shares");
                    return Ok(Enumeration {
                        host: host.to_string(),
                        shares,
                        strategy,
                        auth: match auth {
                            ListingAuth::User { username, secret } => MountAuth { username, secret },
                            ListingAuth::Guest => MountAuth {
                                username: GUEST_ACCOUNT.to_string(),
                                secret: String::new(),
                            },
                        },
                    });
                }
                Err(e) if !e.is_recoverable() => {
                    warn!(host, ?strategy, error = %e, "Share listing cannot succeed, giving up");
                    return Err(ConnectError::Enumeration {
                        host: host.to_string(),
                        last: e,
                    });
                }
                Err(e) => {
                    warn!(host, ?strategy, error = %e, "Share listing attempt failed");
                    last_error = Some(e);
                    if index + 1 < total {
                        tokio::time::sleep(self.options.backoff).await;
                    }
                }
            }
        }

        Err(match last_error {
            Some(last) => ConnectError::Enumeration {
                host: host.to_string(),
                last,
            },
            None => ConnectError::NoStrategy(host.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_strategy_only_when_username_differs() {
        let plain = ShareConnector::strategies(&Credential::new("alice", "pw"));
        let kinds: Vec<_> = plain.iter().map(|(s, _)| *s).collect();
        assert_eq!(kinds, vec![Strategy::StrippedUser, Strategy::Guest]);

        let qualified = ShareConnector::strategies(&Credential::new("CORP\\alice", "pw"));
        let kinds: Vec<_> = qualified.iter().map(|(s, _)| *s).collect();
        assert_eq!(
            kinds,
            vec![Strategy::StrippedUser, Strategy::QualifiedUser, Strategy::Guest]
        );
        assert_eq!(
            qualified[0].1,
            ListingAuth::User {
                username: "alice".to_string(),
                secret: "pw".to_string()
            }
        );
    }

    #[test]
    fn empty_username_goes_straight_to_guest() {
        let strategies = ShareConnector::strategies(&Credential::new("", ""));
        assert_eq!(strategies.len(), 1);
        assert_eq!(strategies[0].1, ListingAuth::Guest);
    }
}
