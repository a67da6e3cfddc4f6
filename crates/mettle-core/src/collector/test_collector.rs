//! Collector emitting a single random gauge, for smoke-testing a pipeline.

use async_trait::async_trait;

use super::{Collector, CollectorBase};
use crate::config::{Options, get_as_string};
use crate::metric::Metric;

const DEFAULT_METRIC_NAME: &str = "test_metric";

pub struct TestCollector {
    base: CollectorBase,
    metric_name: String,
}

impl TestCollector {
    pub fn new(base: CollectorBase) -> Self {
        Self {
            base,
            metric_name: DEFAULT_METRIC_NAME.to_string(),
        }
    }

    pub(crate) fn boxed(base: CollectorBase) -> Box<dyn Collector> {
        Box::new(Self::new(base))
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }
}

#[async_trait]
impl Collector for TestCollector {
    fn base(&self) -> &CollectorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CollectorBase {
        &mut self.base
    }

    fn configure(&mut self, options: &Options) {
        if let Some(name) = options.get("metricName").and_then(get_as_string)
            && !name.is_empty()
        {
            self.metric_name = name;
        }
        self.base.configure_common(options);
    }

    async fn collect(&mut self) {
        let metric = Metric::new(self.metric_name.as_str()).with_value(rand::random::<f64>());
        self.base.send(metric).await;
    }
}
