pub mod config;
pub mod experiment;
pub mod meta;
pub mod quantity;
pub mod selector;
pub mod trial;

pub use config::{
    Config, ControllerConfig, LogFormat, LoggingConfig, MetricsConfig, RequiredMetrics,
    RetryConfig, RotationPolicy, SuggestionConfig, TrialConfig,
};
pub use experiment::{
    Experiment, ANNOTATION_EXPERIMENT_URL, EXPERIMENT_FINALIZER, ExperimentSpec, ExperimentStatus, Metric, MetricType, Parameter, PatchTemplate,
    PatchType, PortRef, TrialTemplateSpec,
};
pub use meta::{ObjectMeta, ObjectReference, Resource};
pub use quantity::{Quantity, QuantityError};
pub use selector::{LabelSelector, LabelSelectorRequirement, SelectorError, SelectorOperator};
pub use trial::{
    Assignment, AssignmentValue, ConditionStatus, PatchOperation, SetupTask, Trial,
    TrialCondition, TrialConditionType, TrialSpec, TrialStatus, TrialValue,
    ANNOTATION_INITIALIZER, ANNOTATION_REPORT_TRIAL_URL, LABEL_EXPERIMENT, LABEL_TRIAL,
    LABEL_TRIAL_ROLE, REPORT_FINALIZER, ROLE_TRIAL_RUN, ROLE_TRIAL_SETUP, SETUP_FINALIZER,
};
