//! Resolved pipeline settings.

use std::time::Duration;

use kiln_cluster::ProductionTemplates;
use kiln_core::{ConfigError, KilnConfig, NamespaceStrategy, PromotionPolicy};

/// Pipeline knobs with durations parsed and templates assembled.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub poll_attempts: u32,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub promotion_policy: PromotionPolicy,
    pub sentinel: String,
    pub failure_markers: Vec<String>,
    pub namespace: NamespaceStrategy,
    pub templates: ProductionTemplates,
}

impl PipelineSettings {
    pub fn from_config(config: &KilnConfig) -> Result<Self, ConfigError> {
        let pipeline = &config.pipeline;
        let cluster = &config.cluster;
        Ok(Self {
            poll_attempts: pipeline.poll_attempts,
            poll_interval: pipeline.poll_interval()?,
            settle_delay: pipeline.settle_delay()?,
            promotion_policy: pipeline.promotion_policy,
            sentinel: pipeline.sentinel.clone(),
            failure_markers: pipeline.failure_markers.clone(),
            namespace: pipeline.namespace.clone(),
            templates: ProductionTemplates {
                app_image: cluster.app_image.clone(),
                store_image: cluster.store_image.clone(),
                store_password: cluster.store_password.clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = PipelineSettings::from_config(&KilnConfig::default()).unwrap();
        assert_eq!(settings.poll_attempts, 60);
        assert_eq!(settings.poll_interval, Duration::from_secs(1));
        assert_eq!(settings.settle_delay, Duration::from_secs(2));
        assert_eq!(settings.promotion_policy, PromotionPolicy::FailOpen);
        assert_eq!(settings.sentinel, "Code updated, running...");
        assert_eq!(settings.templates.store_image, "postgres:13");
    }

    #[test]
    fn from_toml_overrides() {
        let config = KilnConfig::from_toml(
            r#"
            [pipeline]
            poll_attempts = 5
            poll_interval = "250ms"
            promotion_policy = "fail_closed"

            [pipeline.namespace]
            mode = "fixed"
            name = "user-test"
            "#,
        )
        .unwrap();
        let settings = PipelineSettings::from_config(&config).unwrap();
        assert_eq!(settings.poll_attempts, 5);
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.promotion_policy, PromotionPolicy::FailClosed);
        assert_eq!(settings.namespace.namespace_for("alice"), "user-test");
    }
}
