use crate::State;
use crate::gps::client::{GpsError, cached_roster, cached_token};
use crate::gps::provider::Provider;
use crate::gps::{most_recent, upsert_position};
use anyhow::Context;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{error, info, warn};
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct BatchSummary {
    pub success: bool,
    pub updated: u32,
    pub results: Vec<ModemOutcome>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ModemOutcome {
    pub modem_id: String,
    pub provider: String,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Error,
    RateLimited,
}

/// Cron-driven reconciliation: lists the full modem roster, fans out one GPS
/// request per provider and upserts the freshest fix per modem. Provider
/// groups fail independently; only a roster failure aborts the batch.
pub async fn run_batch(state: &State) -> anyhow::Result<BatchSummary> {
    let roster = cached_roster(&state.compass, &state.cache)
        .await
        .context("failed to list modems")?;

    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    for modem in roster {
        groups.entry(modem.provider).or_default().push(modem.id);
    }

    let mut updated = 0u32;
    let mut results = Vec::new();

    for (provider_name, ids) in groups {
        let Some(provider) = Provider::parse(&provider_name) else {
            warn!(provider = %provider_name, "no gps endpoint for provider, skipping group");
            results.extend(ids.into_iter().map(|modem_id| ModemOutcome {
                modem_id,
                provider: provider_name.clone(),
                status: OutcomeStatus::Error,
                message: Some("no gps endpoint".to_string()),
            }));
            continue;
        };

        let token = match cached_token(&state.compass, &state.cache).await {
            Ok(token) => token,
            Err(err) => {
                error!(provider = provider.as_str(), "authentication failed: {err}");
                results.extend(error_outcomes(ids, provider, "authentication failed"));
                continue;
            }
        };

        match state.compass.fetch_gps(provider, &ids, &token).await {
            Ok(fixes_by_modem) => {
                for modem_id in ids {
                    let fix = fixes_by_modem
                        .get(&modem_id)
                        .and_then(|fixes| most_recent(fixes));
                    let Some(fix) = fix else {
                        results.push(ModemOutcome {
                            modem_id,
                            provider: provider.as_str().to_string(),
                            status: OutcomeStatus::Error,
                            message: Some("no valid fix returned".to_string()),
                        });
                        continue;
                    };
                    match upsert_position(&state.pg_pool, &modem_id, provider.as_str(), fix).await {
                        Ok(()) => {
                            updated += 1;
                            results.push(ModemOutcome {
                                modem_id,
                                provider: provider.as_str().to_string(),
                                status: OutcomeStatus::Success,
                                message: None,
                            });
                        }
                        Err(err) => {
                            error!(%modem_id, "failed to store gps fix: {err}");
                            results.push(ModemOutcome {
                                modem_id,
                                provider: provider.as_str().to_string(),
                                status: OutcomeStatus::Error,
                                message: Some("failed to store fix".to_string()),
                            });
                        }
                    }
                }
            }
            Err(GpsError::RateLimited { retry_after_secs }) => {
                warn!(
                    provider = provider.as_str(),
                    retry_after_secs, "provider group rate limited"
                );
                results.extend(ids.into_iter().map(|modem_id| ModemOutcome {
                    modem_id,
                    provider: provider.as_str().to_string(),
                    status: OutcomeStatus::RateLimited,
                    message: Some(format!("retry after {retry_after_secs}s")),
                }));
            }
            Err(err) => {
                error!(provider = provider.as_str(), "gps fetch failed: {err}");
                results.extend(error_outcomes(ids, provider, "gps fetch failed"));
            }
        }
    }

    info!(updated, modems = results.len(), "gps batch complete");
    Ok(BatchSummary {
        success: true,
        updated,
        results,
    })
}

fn error_outcomes(
    ids: Vec<String>,
    provider: Provider,
    message: &str,
) -> impl Iterator<Item = ModemOutcome> + '_ {
    ids.into_iter().map(move |modem_id| ModemOutcome {
        modem_id,
        provider: provider.as_str().to_string(),
        status: OutcomeStatus::Error,
        message: Some(message.to_string()),
    })
}
