use routebird_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum K8sError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

impl From<K8sError> for CoreError {
    fn from(e: K8sError) -> Self {
        CoreError::Observation(e.to_string())
    }
}
