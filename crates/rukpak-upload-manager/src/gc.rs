//! The orphan-upload sweep: on a fixed tick, any blob whose owning
//! `BundleDeployment` no longer exists is removed.

use std::time::Duration;

use kube::api::Api;
use rukpak_core::upload_store::UploadStore;
use rukpak_crd::BundleDeployment;

pub async fn run(store: UploadStore, deployments: Api<BundleDeployment>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        sweep_once(&store, &deployments).await;
    }
}

async fn sweep_once(store: &UploadStore, deployments: &Api<BundleDeployment>) {
    let names = match store.list_deployment_names().await {
        Ok(names) => names,
        Err(err) => {
            tracing::warn!(error = %err, "failed to list upload storage root during GC sweep");
            return;
        }
    };

    for name in names {
        match deployments.get_opt(&name).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::info!(name, "removing orphaned upload blob: owning deployment is gone");
                if let Err(err) = store.delete(&name).await {
                    tracing::warn!(error = %err, name, "failed to remove orphaned upload blob");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, name, "failed to look up owning deployment during GC sweep");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sweep_is_a_noop_on_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path());
        assert_eq!(store.list_deployment_names().await.unwrap(), Vec::<String>::new());
    }
}
