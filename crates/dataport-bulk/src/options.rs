//! Options for bulk operations.

use dataport_client::{BypassLogic, CallOptions};
use dataport_core::error::MigrationError;

/// The service's hard cap on records per bulk request.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Validated options for one bulk operation.
#[derive(Debug, Clone)]
pub struct BulkOptions {
    /// Records per batch, at most [`MAX_BATCH_SIZE`]. Default: 100.
    pub(crate) batch_size: usize,
    /// Record batch-local failures and keep going instead of cancelling
    /// remaining batches.
    pub(crate) continue_on_error: bool,
    pub(crate) bypass_custom_logic: BypassLogic,
    pub(crate) bypass_power_automate: bool,
    pub(crate) suppress_duplicate_detection: bool,
    /// Free-form tag surfaced in server-side execution context.
    pub(crate) tag: Option<String>,
    /// Optional static cap on concurrent batches, applied on top of the
    /// pool recommendation and the rate controller.
    pub(crate) max_parallel_batches: Option<usize>,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            continue_on_error: false,
            bypass_custom_logic: BypassLogic::empty(),
            bypass_power_automate: false,
            suppress_duplicate_detection: false,
            tag: None,
            max_parallel_batches: None,
        }
    }
}

impl BulkOptions {
    pub fn builder() -> BulkOptionsBuilder {
        BulkOptionsBuilder::new()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn continue_on_error(&self) -> bool {
        self.continue_on_error
    }

    pub fn max_parallel_batches(&self) -> Option<usize> {
        self.max_parallel_batches
    }

    /// The per-request parameters these options translate to.
    pub fn call_options(&self) -> CallOptions {
        CallOptions {
            bypass_custom_logic: self.bypass_custom_logic,
            bypass_power_automate: self.bypass_power_automate,
            suppress_duplicate_detection: self.suppress_duplicate_detection,
            tag: self.tag.clone(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), MigrationError> {
        if self.batch_size == 0 {
            return Err(MigrationError::Configuration(
                "batch_size must be positive".into(),
            ));
        }
        if self.batch_size > MAX_BATCH_SIZE {
            return Err(MigrationError::Configuration(format!(
                "batch_size {} exceeds the service limit of {MAX_BATCH_SIZE}",
                self.batch_size
            )));
        }
        if self.max_parallel_batches == Some(0) {
            return Err(MigrationError::Configuration(
                "max_parallel_batches must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`BulkOptions`].
#[derive(Debug, Clone, Default)]
pub struct BulkOptionsBuilder {
    options: BulkOptions,
}

impl BulkOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records per batch. Default: 100, maximum 1000.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.options.batch_size = batch_size;
        self
    }

    /// Keep going past batch-local failures. Default: false.
    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.options.continue_on_error = continue_on_error;
        self
    }

    /// Bypass categories of custom server-side logic.
    pub fn bypass_custom_logic(mut self, bypass: BypassLogic) -> Self {
        self.options.bypass_custom_logic = bypass;
        self
    }

    /// Suppress flow-trigger expansion jobs.
    pub fn bypass_power_automate(mut self, bypass: bool) -> Self {
        self.options.bypass_power_automate = bypass;
        self
    }

    /// Suppress duplicate detection rules.
    pub fn suppress_duplicate_detection(mut self, suppress: bool) -> Self {
        self.options.suppress_duplicate_detection = suppress;
        self
    }

    /// Tag surfaced in server-side execution context.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.options.tag = Some(tag.into());
        self
    }

    /// Static cap on concurrent batches.
    pub fn max_parallel_batches(mut self, max: usize) -> Self {
        self.options.max_parallel_batches = Some(max);
        self
    }

    pub fn build(self) -> Result<BulkOptions, MigrationError> {
        self.options.validate()?;
        Ok(self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataport_core::error::ErrorKind;

    #[test]
    fn defaults() {
        let options = BulkOptions::default();
        assert_eq!(options.batch_size(), 100);
        assert!(!options.continue_on_error());
        assert!(options.max_parallel_batches().is_none());
        assert!(options.call_options().to_parameters().is_empty());
    }

    #[test]
    fn oversized_batch_rejected_as_configuration() {
        let error = BulkOptions::builder().batch_size(1001).build().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn zero_batch_rejected() {
        assert!(BulkOptions::builder().batch_size(0).build().is_err());
    }

    #[test]
    fn thousand_is_accepted() {
        let options = BulkOptions::builder().batch_size(1000).build().unwrap();
        assert_eq!(options.batch_size(), 1000);
    }

    #[test]
    fn call_options_carry_bypass_and_tag() {
        let options = BulkOptions::builder()
            .bypass_custom_logic(BypassLogic::ALL)
            .suppress_duplicate_detection(true)
            .tag("reference-load")
            .build()
            .unwrap();
        let parameters = options.call_options().to_parameters();
        assert!(parameters
            .iter()
            .any(|(k, v)| *k == "BypassBusinessLogicExecution" && v == "CustomSync,CustomAsync"));
        assert!(parameters.iter().any(|(k, v)| *k == "tag" && v == "reference-load"));
    }
}
