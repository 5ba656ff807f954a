pub mod catalog;
pub mod checker;
pub mod error;
pub mod jwt;
pub mod period;
pub mod subscription;
pub mod sweeper;
pub mod usage;

pub use catalog::UsageLimitsCatalog;
pub use checker::LimitChecker;
pub use error::{ServiceError, ServiceResult};
pub use jwt::JwtService;
pub use subscription::SubscriptionManager;
pub use usage::UsageTracker;

use rocket::{Build, Rocket};
use std::sync::Arc;

use crate::db::Stores;
use crate::services::period::Clock;

/// The engine's services, built once at ignition and handed to Rocket as managed state.
#[derive(Clone)]
pub struct Services {
    pub subscriptions: SubscriptionManager,
    pub catalog: UsageLimitsCatalog,
    pub tracker: UsageTracker,
    pub checker: LimitChecker,
}

impl Services {
    pub fn new(stores: Stores, clock: Arc<dyn Clock>) -> Self {
        let catalog = UsageLimitsCatalog::new(stores.usage_limits, clock.clone());
        let tracker = UsageTracker::new(stores.usage, clock.clone());
        let subscriptions = SubscriptionManager::new(stores.subscriptions, catalog.clone(), clock);
        let checker = LimitChecker::new(catalog.clone(), tracker.clone(), subscriptions.clone());

        Services { subscriptions, catalog, tracker, checker }
    }

    pub fn manage(self, rocket: Rocket<Build>) -> Rocket<Build> {
        rocket
            .manage(self.subscriptions)
            .manage(self.catalog)
            .manage(self.tracker)
            .manage(self.checker)
    }
}
