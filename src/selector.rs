//! Local/cloud provider selection
//!
//! Health checks run one after another. Local is always probed first under
//! `local_prefer` and cloud is only consulted when local is down, so a healthy
//! local backend never costs a cloud call.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::providers::{Capability, Provider, ProviderPair};
use crate::types::AiMode;

/// Which health checks ran during a selection, and what they returned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud: Option<bool>,
}

/// The chosen provider plus the probes that led to it
pub struct Selected<P: ?Sized> {
    pub provider: Arc<P>,
    pub health: HealthReport,
}

/// Pick one provider for `capability` under `mode`
pub async fn select<P>(capability: Capability, mode: AiMode, pair: &ProviderPair<P>) -> Result<Selected<P>>
where
    P: Provider + ?Sized,
{
    let mut health = HealthReport::default();

    let chosen = match mode {
        AiMode::LocalOnly => {
            let ok = pair.local.health_check().await;
            health.local = Some(ok);
            if !ok {
                return Err(Error::ProviderUnavailable(format!("Local {capability} unavailable")));
            }
            pair.local.clone()
        }
        AiMode::CloudOnly => {
            let ok = pair.cloud.health_check().await;
            health.cloud = Some(ok);
            if !ok {
                return Err(Error::ProviderUnavailable(format!("Cloud {capability} unavailable")));
            }
            pair.cloud.clone()
        }
        AiMode::LocalPrefer => {
            let local_ok = pair.local.health_check().await;
            health.local = Some(local_ok);
            if local_ok {
                pair.local.clone()
            } else {
                let cloud_ok = pair.cloud.health_check().await;
                health.cloud = Some(cloud_ok);
                if !cloud_ok {
                    return Err(Error::ProviderUnavailable(format!(
                        "No {capability} provider available"
                    )));
                }
                pair.cloud.clone()
            }
        }
    };

    debug!(
        capability = capability.label(),
        mode = mode.as_str(),
        kind = chosen.kind().as_str(),
        model = chosen.model(),
        "Provider selected"
    );

    Ok(Selected {
        provider: chosen,
        health,
    })
}
