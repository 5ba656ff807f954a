use log::{error, info};
use rocket::fairing::AdHoc;
use std::time::Duration;

use crate::config::Config;
use crate::services::SubscriptionManager;

/// Runs the expiry sweep every `sweep_interval_secs` once Rocket has lifted off.
pub fn init() -> AdHoc {
    AdHoc::on_liftoff("Expiry sweep", |rocket| {
        Box::pin(async move {
            let interval_secs = Config::sweep_interval_secs();
            if interval_secs == 0 {
                info!("Expiry sweep disabled");
                return;
            }

            let Some(manager) = rocket.state::<SubscriptionManager>().cloned() else {
                error!("Expiry sweep not started: subscription manager is not managed");
                return;
            };

            let shutdown = rocket.shutdown();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match manager.process_expired_subscriptions().await {
                                Ok(report) if report.transitioned.is_empty() && report.failed.is_empty() => {}
                                Ok(report) => info!(
                                    "Expiry sweep cancelled {} subscriptions, {} failed",
                                    report.transitioned.len(),
                                    report.failed.len()
                                ),
                                Err(e) => error!("Expiry sweep failed: {}", e),
                            }
                        }
                        _ = shutdown.clone() => break,
                    }
                }
            });

            info!("Expiry sweep scheduled every {}s", interval_secs);
        })
    })
}
