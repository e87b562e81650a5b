use std::collections::HashMap;
use std::sync::Arc;

use super::ccbill::CcbillGateway;
use super::fake::FakeGateway;
use super::tilled::TilledGateway;
use super::{GatewayDriver, GatewayError};
use crate::config::Config;

/// Explicit registry of gateway drivers, built once at startup and injected
/// into the services.
#[derive(Clone)]
pub struct PaymentGatewayManager {
    drivers: HashMap<String, Arc<dyn GatewayDriver>>,
    default_driver: String,
}

impl PaymentGatewayManager {
    pub fn new(default_driver: impl Into<String>) -> Self {
        Self {
            drivers: HashMap::new(),
            default_driver: default_driver.into(),
        }
    }

    /// Register a driver under its own name, replacing any previous one
    pub fn register(mut self, driver: Arc<dyn GatewayDriver>) -> Self {
        self.drivers.insert(driver.name().to_string(), driver);
        self
    }

    /// Build the registry from configuration. The fake driver is always
    /// present; real drivers only when their credentials are configured.
    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let mut manager = Self::new(config.default_gateway.clone())
            .register(Arc::new(FakeGateway::new(config.fake_webhook_secret.clone())));

        if let Some(tilled) = &config.tilled {
            manager = manager.register(Arc::new(TilledGateway::new(tilled.clone())?));
        }
        if let Some(ccbill) = &config.ccbill {
            manager = manager.register(Arc::new(CcbillGateway::new(ccbill.clone())?));
        }

        if !manager.drivers.contains_key(&manager.default_driver) {
            return Err(GatewayError::Config(format!(
                "default gateway '{}' is not configured",
                manager.default_driver
            )));
        }

        tracing::info!(
            drivers = ?manager.driver_names(),
            default = %manager.default_driver,
            "Payment gateways registered"
        );

        Ok(manager)
    }

    /// Look up a driver by name
    pub fn driver(&self, name: &str) -> Option<Arc<dyn GatewayDriver>> {
        self.drivers.get(name).cloned()
    }

    pub fn default_driver(&self) -> &str {
        &self.default_driver
    }

    pub fn driver_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name() {
        let manager = PaymentGatewayManager::new("fake").register(Arc::new(FakeGateway::new("s")));
        assert!(manager.driver("fake").is_some());
        assert!(manager.driver("stripe").is_none());
        assert_eq!(manager.default_driver(), "fake");
        assert_eq!(manager.driver_names(), vec!["fake"]);
    }
}
