use thiserror::Error;

use crate::network::NetworkError;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("network failure: {0}")]
    Network(#[from] NetworkError),
}
