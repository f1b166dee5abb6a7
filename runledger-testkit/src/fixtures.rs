use std::collections::BTreeMap;

use runledger::*;
use serde_json::json;

pub const DEFAULT_DATASET: &str = "faces";
pub const DEFAULT_PRESET: &str = "sdxl-default";
pub const DEFAULT_MODE: &str = "train_only";

pub fn job_id(value: &str) -> JobId {
    JobId::parse(value).expect("fixture job id is valid")
}

/// A 100-step job on the default dataset.
pub fn new_job(id: &str) -> NewJob {
    NewJob::new(job_id(id), DEFAULT_MODE, DEFAULT_DATASET, DEFAULT_PRESET).with_total_steps(100)
}

pub fn new_job_on(id: &str, dataset: &str) -> NewJob {
    NewJob::new(job_id(id), DEFAULT_MODE, dataset, DEFAULT_PRESET).with_total_steps(100)
}

/// A learning-rate variation of `parent`.
pub fn new_variation(parent: &str, id: &str, experiment: &str, learning_rate: f64) -> NewVariation {
    let mut varied = BTreeMap::new();
    varied.insert("learning_rate".to_string(), json!([1e-4, 5e-5]));
    let mut values = BTreeMap::new();
    values.insert("learning_rate".to_string(), json!(learning_rate));

    NewVariation {
        job: new_job(id),
        variation: VariationInfo {
            parent_job_id: job_id(parent),
            experiment_name: experiment.to_string(),
            variation_id: format!("{experiment}-{id}"),
            varied_parameters: varied,
            parameter_values: values,
        },
    }
}

/// Statuses a job walks through on the way to `target`.
pub fn path_to(target: JobStatus) -> Vec<JobStatus> {
    if target.is_terminal() {
        return vec![JobStatus::Training, target];
    }
    JobStatus::ALL
        .into_iter()
        .filter(|s| !s.is_terminal() && *s != JobStatus::Pending && *s <= target)
        .collect()
}
