use crate::{
    analytics::NoopAnalyticsSink,
    selection::DEFAULT_FALLBACK_VARIANT,
    store::{AssignmentStore, ExperimentSource},
    AnalyticsSink, ExperimentClient,
};

/// Configuration for [`ExperimentClient`].
pub struct ClientConfig<'a> {
    pub(crate) source: Box<dyn ExperimentSource + 'a>,
    pub(crate) store: Box<dyn AssignmentStore + 'a>,
    pub(crate) analytics_sink: Box<dyn AnalyticsSink + Send + Sync + 'a>,
    pub(crate) fallback_variant: String,
}

impl<'a> ClientConfig<'a> {
    /// Create a configuration that reads experiments from `source` and persists assignments and
    /// events to `store`.
    ///
    /// ```
    /// # use experiments::{ClientConfig, ConfigurationStore, InMemoryAssignmentStore};
    /// ClientConfig::new(ConfigurationStore::new(), InMemoryAssignmentStore::new());
    /// ```
    pub fn new(source: impl ExperimentSource + 'a, store: impl AssignmentStore + 'a) -> Self {
        ClientConfig {
            source: Box::new(source),
            store: Box::new(store),
            analytics_sink: Box::new(NoopAnalyticsSink),
            fallback_variant: ClientConfig::DEFAULT_FALLBACK_VARIANT.to_owned(),
        }
    }

    /// Set the analytics sink that receives assign/expose/convert events.
    ///
    /// ```
    /// # use experiments::{ClientConfig, ConfigurationStore, InMemoryAssignmentStore};
    /// # use experiments::{ExperimentEvent, SinkError};
    /// let mut config = ClientConfig::new(ConfigurationStore::new(), InMemoryAssignmentStore::new());
    /// config.analytics_sink(|name: &str, event: &ExperimentEvent| -> Result<(), SinkError> {
    ///     println!("{name}: {event:?}");
    ///     Ok(())
    /// });
    /// ```
    pub fn analytics_sink(
        &mut self,
        analytics_sink: impl AnalyticsSink + Send + Sync + 'a,
    ) -> &mut Self {
        self.analytics_sink = Box::new(analytics_sink);
        self
    }

    /// Variant served when an experiment names no default and has no variants.
    pub const DEFAULT_FALLBACK_VARIANT: &'static str = DEFAULT_FALLBACK_VARIANT;

    /// Override the last-resort fallback variant.
    pub fn fallback_variant(&mut self, fallback_variant: impl Into<String>) -> &mut Self {
        self.fallback_variant = fallback_variant.into();
        self
    }

    /// Create a new [`ExperimentClient`] using the specified configuration.
    pub fn to_client(self) -> ExperimentClient<'a> {
        ExperimentClient::new(self)
    }
}
